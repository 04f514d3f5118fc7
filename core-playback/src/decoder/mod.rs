//! # Decoder Module
//!
//! Pull-based sources of audio frames and the decorators that transform them.
//!
//! ## Overview
//!
//! Every stage implements [`Decoder`]. Decorators own the decoder they wrap
//! and expose the same trait, so chains compose freely:
//!
//! ```text
//! SymphoniaDecoder ─┐
//! BufferDecoder ────┼─► LoopableRegionDecoder ─► DsdPcmDecoder / DopDecoder ─► Converter
//! ```
//!
//! | Decoder | Input | Output |
//! |---------|-------|--------|
//! | [`SymphoniaDecoder`] | encoded bytes | native PCM, planar |
//! | [`BufferDecoder`] | in-memory frames | same format |
//! | [`DsdPcmDecoder`] | DSD | F32 at `rate / 8` |
//! | [`DopDecoder`] | DSD | S24 DoP frames at `rate / 16` |
//! | [`LoopableRegionDecoder`] | any | same format, region repeated |
//!
//! ## Threading Model
//!
//! Decoders are `Send` and are driven by one thread at a time (the player's
//! decode thread once playback starts).
//!
//! ## Usage Example
//!
//! ```rust
//! use core_playback::decoder::{BufferDecoder, Decoder, LoopMode, LoopableRegionDecoder};
//! use core_playback::{AudioFormat, FrameRange, SampleBuffer, SampleFormat};
//!
//! # fn example() -> core_playback::Result<()> {
//! let format = AudioFormat::pcm(48_000.0, 2, SampleFormat::F32, true);
//! let mut clip = SampleBuffer::new(format.clone(), 480);
//! clip.set_frames(480);
//!
//! let source = BufferDecoder::new(clip);
//! let mut looped = LoopableRegionDecoder::new(source, FrameRange::new(0, 480), LoopMode::Repeat(1));
//! looped.open()?;
//!
//! let mut out = SampleBuffer::new(format, 1024);
//! assert_eq!(looped.decode(&mut out, 1024)?, 960);
//! # Ok(())
//! # }
//! ```

mod buffer;
pub mod dop;
mod dsd_pcm;
mod loopable;

#[cfg(feature = "core-decoder")]
mod symphonia;

pub use self::buffer::BufferDecoder;
pub use self::dop::DopDecoder;
pub use self::dsd_pcm::DsdPcmDecoder;
pub use self::loopable::{LoopMode, LoopableRegionDecoder};

#[cfg(feature = "core-decoder")]
pub use self::symphonia::SymphoniaDecoder;

use crate::buffer::SampleBuffer;
use crate::error::{PlaybackError, Result};
use crate::format::AudioFormat;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecoderState {
    /// Constructed, format unknown.
    Unopened,
    /// Format known, positioned, nothing decoded since the last open/seek.
    Open,
    /// At least one frame produced since the last open/seek.
    Decoding,
    /// End of stream reached.
    AtEnd,
    /// Resources released.
    Closed,
}

impl DecoderState {
    /// Whether `format`, `decode` and `seek` are valid in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DecoderState::Open | DecoderState::Decoding | DecoderState::AtEnd
        )
    }
}

/// A pull-based producer of audio frames.
///
/// # Contract
///
/// - `decode` writes at most `min(max_frames, buf.capacity())` frames starting
///   at frame 0 of `buf`, sets `buf.frames()` and returns the count. `Ok(0)`
///   means end of stream.
/// - `buf` must be laid out in the decoder's output format.
/// - `decode` and `seek` before `open` fail with `InvalidState`.
/// - Seeking to `frame == frame_length()` positions at end; anything past it
///   fails with [`SeekError::OutOfRange`](crate::SeekError::OutOfRange).
pub trait Decoder: Send {
    /// Read stream headers and determine the output format.
    fn open(&mut self) -> Result<()>;

    /// Release resources. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;

    fn state(&self) -> DecoderState;

    fn is_open(&self) -> bool {
        self.state().is_active()
    }

    /// Output format. Only available once open.
    fn format(&self) -> Result<&AudioFormat>;

    /// Produce up to `max_frames` frames into `buf`.
    fn decode(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> Result<usize>;

    /// Reposition so the next `decode` starts at `frame`.
    fn seek(&mut self, frame: u64) -> Result<()>;

    fn supports_seeking(&self) -> bool;

    /// Index of the next frame `decode` will produce.
    fn frame_position(&self) -> u64;

    /// Total frames, when known.
    fn frame_length(&self) -> Option<u64>;
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn state(&self) -> DecoderState {
        (**self).state()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn format(&self) -> Result<&AudioFormat> {
        (**self).format()
    }

    fn decode(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> Result<usize> {
        (**self).decode(buf, max_frames)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        (**self).seek(frame)
    }

    fn supports_seeking(&self) -> bool {
        (**self).supports_seeking()
    }

    fn frame_position(&self) -> u64 {
        (**self).frame_position()
    }

    fn frame_length(&self) -> Option<u64> {
        (**self).frame_length()
    }
}

/// Fail with `InvalidState` unless the decoder is open.
pub(crate) fn ensure_open(state: DecoderState, operation: &str) -> Result<()> {
    if state.is_active() {
        Ok(())
    } else {
        Err(PlaybackError::InvalidState(format!(
            "cannot {} a decoder in state {:?}",
            operation, state
        )))
    }
}

/// Fail with `Format` unless `buf` is laid out as `format`.
pub(crate) fn check_output_buffer(format: &AudioFormat, buf: &SampleBuffer) -> Result<()> {
    let actual = buf.format();
    if actual.sample_format != format.sample_format
        || actual.channels != format.channels
        || actual.interleaved != format.interleaved
    {
        return Err(PlaybackError::Format(format!(
            "output buffer is {:?}x{} (interleaved: {}), decoder produces {:?}x{} (interleaved: {})",
            actual.sample_format,
            actual.channels,
            actual.interleaved,
            format.sample_format,
            format.channels,
            format.interleaved
        )));
    }
    Ok(())
}

/// Open `decoder` unless it already is.
pub(crate) fn open_if_needed<D: Decoder + ?Sized>(decoder: &mut D) -> Result<()> {
    if decoder.is_open() {
        Ok(())
    } else {
        decoder.open()
    }
}

/// The wrapped decoder must produce DSD for the bitstream decorators.
pub(crate) fn require_dsd(format: &AudioFormat, decorator: &str) -> Result<()> {
    if format.is_dsd() {
        Ok(())
    } else {
        Err(PlaybackError::Format(format!(
            "{} requires a DSD source, got {:?}",
            decorator, format.sample_format
        )))
    }
}
