//! # Playback Pipeline
//!
//! Decoder composition and real-time playback for PCM and DSD sources.
//!
//! ## Overview
//!
//! This crate handles:
//! - Decoding through a common [`Decoder`] trait (symphonia-backed codecs
//!   behind features, in-memory buffers always)
//! - Composable decorators: DSD to PCM decimation, DoP framing and
//!   seamless region looping
//! - Format and sample-rate conversion into a session target format
//! - An SPSC [`RingBuffer`] split into a decode-side [`RingProducer`] and a
//!   [`RingConsumer`] owned by the real-time render callback
//! - Transport control (play, pause, resume, stop, seek) through
//!   [`PlayerNode`], with notifications delivered to a [`PlayerObserver`]
//!
//! ## Usage
//!
//! ```rust
//! use core_playback::decoder::BufferDecoder;
//! use core_playback::{
//!     AudioFormat, NullObserver, PlayerConfig, PlayerNode, SampleBuffer, SampleFormat,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> core_playback::Result<()> {
//! let format = AudioFormat::pcm(48_000.0, 2, SampleFormat::F32, true);
//! let (node, mut renderer) =
//!     PlayerNode::new(format.clone(), PlayerConfig::default(), Arc::new(NullObserver))?;
//!
//! let mut source = SampleBuffer::new(format.clone(), 4800);
//! source.set_frames(4800);
//! node.play(Box::new(BufferDecoder::new(source)))?;
//!
//! // Inside the audio device callback:
//! let mut block = SampleBuffer::new(format, 256);
//! renderer.render(&mut block, 256);
//! assert_eq!(block.frames(), 256);
//!
//! node.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod converter;
pub mod decoder;
pub mod error;
pub mod events;
pub mod format;
pub mod player;
pub mod ring_buffer;
pub mod semaphore;

pub use buffer::{SampleBuffer, SampleData, DSD_SILENCE_BYTE};
pub use config::{ConverterConfig, PlayerConfig};
pub use converter::Converter;
pub use decoder::{
    BufferDecoder, Decoder, DecoderState, DopDecoder, DsdPcmDecoder, LoopMode,
    LoopableRegionDecoder,
};
pub use error::{PlaybackError, Result, SeekError};
pub use events::{NullObserver, PlayerEvent, PlayerObserver};
pub use format::{AudioFormat, ChannelLayout, FormatKind, FrameRange, SampleFormat, DSD_FRAMES_PER_BYTE};
pub use player::{PlayerNode, Renderer, TransportState};
pub use ring_buffer::{RingBuffer, RingConsumer, RingProducer};
pub use semaphore::Semaphore;

#[cfg(feature = "core-decoder")]
pub use decoder::SymphoniaDecoder;
