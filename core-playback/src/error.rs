//! # Playback Error Types
//!
//! Error taxonomy for decoding, conversion, and playback control.
//!
//! Buffer underruns are deliberately absent: an underrun is a recoverable
//! condition reported through [`PlayerEvent::Underrun`](crate::PlayerEvent),
//! never an error. The real-time render path does not produce errors at all.

use bridge_traits::BridgeError;
use thiserror::Error;

/// Reasons a seek request can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeekError {
    /// The decoder (or its byte source) cannot reposition.
    #[error("Seeking not supported")]
    Unsupported,

    /// The target frame lies past the end of the stream.
    #[error("Seek to frame {frame} is out of range (length {length:?})")]
    OutOfRange { frame: u64, length: Option<u64> },

    /// The underlying decoder failed while repositioning.
    #[error("Seek failed: {0}")]
    Failed(String),
}

/// Errors that can occur during playback operations.
#[derive(Error, Debug)]
pub enum PlaybackError {
    // ========================================================================
    // Source Errors
    // ========================================================================
    /// I/O error occurred while reading encoded data.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte-stream source reported an error.
    #[error("Source error: {0}")]
    Source(#[from] BridgeError),

    // ========================================================================
    // Format/Codec Errors
    // ========================================================================
    /// Stream header is malformed or the format is not supported.
    #[error("Unsupported or invalid audio format: {0}")]
    Format(String),

    /// Codec failure after decoding started.
    #[error("Decoding error: {0}")]
    Decode(String),

    // ========================================================================
    // Conversion Errors
    // ========================================================================
    /// Source and target formats cannot be converted into each other.
    #[error("Incompatible conversion: {0}")]
    Conversion(String),

    // ========================================================================
    // Playback Control Errors
    // ========================================================================
    /// Seek request failed.
    #[error(transparent)]
    Seek(#[from] SeekError),

    /// Operation is not valid in the current decoder or transport state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration values are inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlaybackError {
    /// Returns `true` if this error originates from the byte-stream source.
    pub fn is_io_error(&self) -> bool {
        matches!(self, PlaybackError::Io(_) | PlaybackError::Source(_))
    }

    /// Returns `true` if this error is related to stream format issues.
    pub fn is_format_error(&self) -> bool {
        matches!(self, PlaybackError::Format(_))
    }

    /// Returns `true` if this error is a failed seek.
    pub fn is_seek_error(&self) -> bool {
        matches!(self, PlaybackError::Seek(_))
    }

    /// Returns `true` if this error was raised while building a converter.
    pub fn is_conversion_error(&self) -> bool {
        matches!(self, PlaybackError::Conversion(_))
    }
}

/// Result type for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;
