//! # Player Notifications
//!
//! Typed events emitted by the [`PlayerNode`](crate::player::PlayerNode).
//!
//! Events are delivered synchronously to an injected [`PlayerObserver`] from
//! non-real-time threads only: the control thread calling into the player,
//! or the decode thread. The render callback never emits events; it records
//! underruns and the decode thread reports them.
//!
//! ## Usage
//!
//! ```rust
//! use core_playback::{PlayerEvent, PlayerObserver};
//! use std::sync::Mutex;
//!
//! let seen = Mutex::new(Vec::new());
//! let observer = |event: PlayerEvent| seen.lock().unwrap().push(event.to_string());
//! observer.on_event(PlayerEvent::SeekCompleted(4410));
//! assert_eq!(seen.lock().unwrap()[0], "seek completed at frame 4410");
//! ```

use crate::error::PlaybackError;
use std::fmt;
use std::sync::Arc;

/// Playback lifecycle notification.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// Playback started or resumed.
    PlaybackStarted,
    PlaybackPaused,
    /// The source was fully rendered.
    PlaybackEnded,
    /// Playback was stopped by the caller.
    PlaybackStopped,
    /// A seek finished; carries the new frame position.
    SeekCompleted(u64),
    /// The render callback ran short; carries the missing frame count.
    Underrun(u64),
    /// Decoding failed and playback stopped.
    DecodeError(Arc<PlaybackError>),
}

impl PlayerEvent {
    /// Whether this event ends the current playback session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlayerEvent::PlaybackEnded | PlayerEvent::PlaybackStopped | PlayerEvent::DecodeError(_)
        )
    }
}

impl fmt::Display for PlayerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerEvent::PlaybackStarted => write!(f, "playback started"),
            PlayerEvent::PlaybackPaused => write!(f, "playback paused"),
            PlayerEvent::PlaybackEnded => write!(f, "playback ended"),
            PlayerEvent::PlaybackStopped => write!(f, "playback stopped"),
            PlayerEvent::SeekCompleted(frame) => write!(f, "seek completed at frame {}", frame),
            PlayerEvent::Underrun(frames) => write!(f, "underrun of {} frames", frames),
            PlayerEvent::DecodeError(e) => write!(f, "decode error: {}", e),
        }
    }
}

/// Receiver for [`PlayerEvent`]s.
#[cfg_attr(test, mockall::automock)]
pub trait PlayerObserver: Send + Sync {
    fn on_event(&self, event: PlayerEvent);
}

impl<F> PlayerObserver for F
where
    F: Fn(PlayerEvent) + Send + Sync,
{
    fn on_event(&self, event: PlayerEvent) {
        self(event)
    }
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl PlayerObserver for NullObserver {
    fn on_event(&self, _event: PlayerEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SeekError;

    #[test]
    fn test_terminal_events() {
        assert!(PlayerEvent::PlaybackEnded.is_terminal());
        assert!(PlayerEvent::PlaybackStopped.is_terminal());
        assert!(!PlayerEvent::Underrun(12).is_terminal());
        assert!(!PlayerEvent::SeekCompleted(0).is_terminal());
    }

    #[test]
    fn test_decode_error_display() {
        let event = PlayerEvent::DecodeError(Arc::new(PlaybackError::Seek(SeekError::Unsupported)));
        assert!(event.is_terminal());
        assert!(event.to_string().starts_with("decode error"));
    }

    #[test]
    fn test_mock_observer_receives_event() {
        let mut observer = MockPlayerObserver::new();
        observer
            .expect_on_event()
            .withf(|event| matches!(event, PlayerEvent::Underrun(64)))
            .times(1)
            .return_const(());

        let observer: Arc<dyn PlayerObserver> = Arc::new(observer);
        observer.on_event(PlayerEvent::Underrun(64));
    }

    #[test]
    fn test_null_observer() {
        NullObserver.on_event(PlayerEvent::PlaybackStarted);
    }
}
