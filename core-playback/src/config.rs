//! # Player Configuration
//!
//! Configuration types for the player node and its converter.

use crate::error::{PlaybackError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Player node configuration.
///
/// Controls ring buffer size, decode granularity, and how long the decode
/// thread sleeps when it has nothing to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Ring buffer capacity in frames (one frame = one sample per channel).
    ///
    /// Default: 16384 frames (~370ms at 44.1kHz).
    #[serde(default = "default_ring_buffer_frames")]
    pub ring_buffer_frames: usize,

    /// Frames converted per decode loop iteration.
    ///
    /// Default: 2048 frames (~46ms at 44.1kHz).
    #[serde(default = "default_decode_chunk_frames")]
    pub decode_chunk_frames: usize,

    /// Upper bound on a single semaphore wait in the decode thread.
    ///
    /// A wake-up racing the wait is never lost for longer than this.
    ///
    /// Default: 10 milliseconds.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: Duration,

    /// Sample-rate converter settings.
    #[serde(default)]
    pub converter: ConverterConfig,

    /// Name given to the decode thread.
    ///
    /// Default: "audio-decode".
    #[serde(default = "default_decode_thread_name")]
    pub decode_thread_name: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            ring_buffer_frames: default_ring_buffer_frames(),
            decode_chunk_frames: default_decode_chunk_frames(),
            wait_timeout: default_wait_timeout(),
            converter: ConverterConfig::default(),
            decode_thread_name: default_decode_thread_name(),
        }
    }
}

impl PlayerConfig {
    /// Create a configuration optimized for low latency.
    ///
    /// - Small ring (~93ms at 44.1kHz)
    /// - Small decode chunks
    /// - Short waits
    pub fn low_latency() -> Self {
        Self {
            ring_buffer_frames: 4096,
            decode_chunk_frames: 512,
            wait_timeout: Duration::from_millis(2),
            converter: ConverterConfig {
                chunk_frames: 256,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration optimized for stability under load.
    ///
    /// - Large ring (~1.5s at 44.1kHz)
    /// - Larger decode chunks for efficiency
    pub fn high_stability() -> Self {
        Self {
            ring_buffer_frames: 65536,
            decode_chunk_frames: 8192,
            wait_timeout: Duration::from_millis(20),
            converter: ConverterConfig {
                chunk_frames: 4096,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.ring_buffer_frames == 0 {
            return Err(PlaybackError::Config(
                "ring_buffer_frames must be > 0".to_string(),
            ));
        }

        if self.decode_chunk_frames == 0 {
            return Err(PlaybackError::Config(
                "decode_chunk_frames must be > 0".to_string(),
            ));
        }

        if self.wait_timeout.is_zero() {
            return Err(PlaybackError::Config(
                "wait_timeout must be > 0".to_string(),
            ));
        }

        if self.decode_thread_name.is_empty() {
            return Err(PlaybackError::Config(
                "decode_thread_name must not be empty".to_string(),
            ));
        }

        self.converter.validate()
    }

    /// Ring buffer latency at a given sample rate.
    pub fn ring_latency(&self, sample_rate: f64) -> Duration {
        Duration::from_secs_f64(self.ring_buffer_frames as f64 / sample_rate)
    }
}

/// Converter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Input frames per resampler chunk (and per decoder pull).
    ///
    /// Default: 1024 frames.
    #[serde(default = "default_converter_chunk_frames")]
    pub chunk_frames: usize,

    /// Headroom for ratio adjustments, relative to the nominal ratio.
    ///
    /// Default: 1.1.
    #[serde(default = "default_max_relative_ratio")]
    pub max_relative_ratio: f64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            chunk_frames: default_converter_chunk_frames(),
            max_relative_ratio: default_max_relative_ratio(),
        }
    }
}

impl ConverterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_frames == 0 {
            return Err(PlaybackError::Config(
                "converter.chunk_frames must be > 0".to_string(),
            ));
        }

        if self.max_relative_ratio < 1.0 {
            return Err(PlaybackError::Config(
                "converter.max_relative_ratio must be >= 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_ring_buffer_frames() -> usize {
    16384
}

fn default_decode_chunk_frames() -> usize {
    2048
}

fn default_wait_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_decode_thread_name() -> String {
    "audio-decode".to_string()
}

fn default_converter_chunk_frames() -> usize {
    1024
}

fn default_max_relative_ratio() -> f64 {
    1.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.ring_buffer_frames, 16384);
        assert_eq!(config.decode_chunk_frames, 2048);
        assert_eq!(config.wait_timeout, Duration::from_millis(10));
        assert_eq!(config.decode_thread_name, "audio-decode");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        let low = PlayerConfig::low_latency();
        let stable = PlayerConfig::high_stability();
        assert!(low.validate().is_ok());
        assert!(stable.validate().is_ok());
        assert!(low.ring_buffer_frames < stable.ring_buffer_frames);
    }

    #[test]
    fn test_config_validation() {
        let mut config = PlayerConfig::default();
        config.ring_buffer_frames = 0;
        assert!(config.validate().is_err());

        let mut config = PlayerConfig::default();
        config.converter.max_relative_ratio = 0.5;
        assert!(matches!(config.validate(), Err(PlaybackError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PlayerConfig =
            serde_json::from_str(r#"{ "ring_buffer_frames": 256 }"#).unwrap();
        assert_eq!(config.ring_buffer_frames, 256);
        assert_eq!(config.decode_chunk_frames, 2048);
        assert_eq!(config.converter, ConverterConfig::default());
    }

    #[test]
    fn test_ring_latency() {
        let config = PlayerConfig::default();
        assert_eq!(config.ring_latency(16384.0), Duration::from_secs(1));
    }
}
