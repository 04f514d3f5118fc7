//! Integration tests for logging system

use bridge_traits::time::{ConsoleLogger, LogLevel};
use core_runtime::logging::{strip_path, LogFormat, LoggingConfig};
use std::sync::Arc;

#[test]
fn test_logging_initialization() {
    // We can only initialize once per process, so we test the config builder
    let config = LoggingConfig::default()
        .with_format(LogFormat::Json)
        .with_level(LogLevel::Debug)
        .with_spans(true);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Debug);
    assert!(config.enable_spans);
    assert!(config.logger_sink.is_none());
}

#[test]
fn test_path_stripping() {
    // Unix paths
    assert_eq!(strip_path("/home/user/music/track01.dsf"), "track01.dsf");
    assert_eq!(strip_path("/var/audio/loop.wav"), "loop.wav");

    // Windows paths
    assert_eq!(strip_path("C:\\Users\\John\\Music\\track.flac"), "track.flac");

    // Already basename
    assert_eq!(strip_path("track.mp3"), "track.mp3");

    // Edge cases
    assert_eq!(strip_path("/var/audio/"), "");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_format_selection() {
    // Debug builds default to Pretty, release builds to JSON
    #[cfg(debug_assertions)]
    assert_eq!(LoggingConfig::default().format, LogFormat::Pretty);

    #[cfg(not(debug_assertions))]
    assert_eq!(LoggingConfig::default().format, LogFormat::Json);
}

#[test]
fn test_filter_configuration() {
    let config =
        LoggingConfig::default().with_filter("core_playback::player=debug,symphonia=warn");

    assert_eq!(
        config.filter,
        Some("core_playback::player=debug,symphonia=warn".to_string())
    );
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true)
        .with_logger_sink(Arc::new(ConsoleLogger::default()));

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
    assert!(config.logger_sink.is_some());
}
