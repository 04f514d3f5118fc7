//! # Ring Buffer for PCM Audio Frames
//!
//! Single-producer / single-consumer queue carrying converted frames from the
//! decode thread (producer) to the render callback (consumer).
//!
//! ## Design
//!
//! - **Storage**: one `ringbuf::HeapRb` of the format's native sample type,
//!   holding interleaved samples. [`RingBuffer::split`] hands out the two
//!   halves; each must be moved to its own thread.
//! - **Frames, not samples**: both halves move whole frames only, so the
//!   queue always holds a multiple of the channel count and
//!   `available_to_read + available_to_write == capacity`.
//! - **Flush**: the producer side only *requests* a flush of everything it
//!   has written so far; the consumer applies it by skipping those frames,
//!   so the read side stays consumer-owned.
//! - **Real-time safety**: `write`, `read` and every query are wait-free and
//!   never allocate.
//!
//! ## Usage
//!
//! ```rust
//! use core_playback::{AudioFormat, RingBuffer, SampleBuffer, SampleFormat};
//!
//! # fn example() -> core_playback::Result<()> {
//! let format = AudioFormat::pcm(48_000.0, 2, SampleFormat::F32, true);
//! let (mut producer, mut consumer) = RingBuffer::new(format.clone(), 1024)?.split();
//!
//! let mut chunk = SampleBuffer::new(format.clone(), 256);
//! chunk.set_frames(256);
//! assert_eq!(producer.write(&chunk, 256), 256);
//!
//! let mut out = SampleBuffer::new(format, 128);
//! assert_eq!(consumer.read(&mut out, 128), 128);
//! assert_eq!(consumer.available_to_read(), 128);
//! # Ok(())
//! # }
//! ```

use crate::buffer::{SampleBuffer, SampleData, UnitLayout};
use crate::error::{PlaybackError, Result};
use crate::format::{AudioFormat, SampleFormat};
use ringbuf::traits::{Consumer as _, Producer as _, Split as _};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

enum Storage {
    S16(HeapRb<i16>),
    S32(HeapRb<i32>),
    F32(HeapRb<f32>),
    F64(HeapRb<f64>),
}

enum ProducerHalf {
    S16(HeapProd<i16>),
    S32(HeapProd<i32>),
    F32(HeapProd<f32>),
    F64(HeapProd<f64>),
}

enum ConsumerHalf {
    S16(HeapCons<i16>),
    S32(HeapCons<i32>),
    F32(HeapCons<f32>),
    F64(HeapCons<f64>),
}

macro_rules! with_half {
    ($half:expr, $enum:ident, $inner:ident => $body:expr) => {
        match $half {
            $enum::S16($inner) => $body,
            $enum::S32($inner) => $body,
            $enum::F32($inner) => $body,
            $enum::F64($inner) => $body,
        }
    };
}

/// Frame counters and flush handshake shared by both halves.
///
/// Each counter has a single writer, so `written - consumed` is the queued
/// frame count as seen from either side.
#[derive(Debug, Default)]
struct Cursors {
    /// Frames pushed since creation. Producer-owned.
    written: AtomicU64,
    /// Frames popped or skipped since creation. Consumer-owned.
    consumed: AtomicU64,
    /// `written` when the last flush was requested.
    flush_target: AtomicU64,
    flush_requested: AtomicBool,
}

impl Cursors {
    fn queued(&self) -> usize {
        let consumed = self.consumed.load(Ordering::Acquire);
        let written = self.written.load(Ordering::Acquire);
        written.saturating_sub(consumed) as usize
    }
}

/// Fixed-capacity SPSC frame queue, before it is split.
pub struct RingBuffer {
    format: AudioFormat,
    capacity: usize,
    storage: Storage,
}

impl RingBuffer {
    /// Create a ring buffer holding `capacity` frames of `format`.
    pub fn new(format: AudioFormat, capacity: usize) -> Result<Self> {
        format.validate()?;
        if capacity == 0 {
            return Err(PlaybackError::Config(
                "ring buffer capacity must be at least one frame".to_string(),
            ));
        }

        let samples = capacity * format.channels as usize;
        let storage = match format.sample_format {
            SampleFormat::S16 => Storage::S16(HeapRb::new(samples)),
            SampleFormat::S24 | SampleFormat::S32 => Storage::S32(HeapRb::new(samples)),
            SampleFormat::F32 => Storage::F32(HeapRb::new(samples)),
            SampleFormat::F64 => Storage::F64(HeapRb::new(samples)),
            SampleFormat::Dsd => {
                return Err(PlaybackError::Format(
                    "ring buffer carries PCM frames only".to_string(),
                ))
            }
        };

        Ok(Self {
            format,
            capacity,
            storage,
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Total capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Split into the producer and consumer halves.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let (producer, consumer) = match self.storage {
            Storage::S16(rb) => {
                let (p, c) = rb.split();
                (ProducerHalf::S16(p), ConsumerHalf::S16(c))
            }
            Storage::S32(rb) => {
                let (p, c) = rb.split();
                (ProducerHalf::S32(p), ConsumerHalf::S32(c))
            }
            Storage::F32(rb) => {
                let (p, c) = rb.split();
                (ProducerHalf::F32(p), ConsumerHalf::F32(c))
            }
            Storage::F64(rb) => {
                let (p, c) = rb.split();
                (ProducerHalf::F64(p), ConsumerHalf::F64(c))
            }
        };
        let cursors = Arc::new(Cursors::default());
        let channels = self.format.channels as usize;

        (
            RingProducer {
                format: self.format.clone(),
                capacity: self.capacity,
                inner: producer,
                cursors: Arc::clone(&cursors),
            },
            RingConsumer {
                format: self.format,
                capacity: self.capacity,
                channels,
                inner: consumer,
                cursors,
            },
        )
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("format", &self.format)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn accepts(ring: &AudioFormat, buf: &SampleBuffer) -> bool {
    let format = buf.format();
    format.sample_format == ring.sample_format && format.channels == ring.channels
}

/// Writing half, owned by the decode side.
pub struct RingProducer {
    format: AudioFormat,
    capacity: usize,
    inner: ProducerHalf,
    cursors: Arc<Cursors>,
}

impl RingProducer {
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames queued and not yet read.
    pub fn available_to_read(&self) -> usize {
        self.cursors.queued().min(self.capacity)
    }

    /// Frames that can be written right now.
    pub fn available_to_write(&self) -> usize {
        self.capacity - self.available_to_read()
    }

    pub fn is_empty(&self) -> bool {
        self.available_to_read() == 0
    }

    pub fn is_full(&self) -> bool {
        self.available_to_write() == 0
    }

    /// Copy up to `frames` valid frames from `buf` into the ring.
    ///
    /// Returns the number of frames written, which never exceeds the space
    /// available before the call. Never overwrites unread frames and never
    /// blocks. A buffer in a different format writes 0.
    pub fn write(&mut self, buf: &SampleBuffer, frames: usize) -> usize {
        if !accepts(&self.format, buf) {
            return 0;
        }
        let count = frames.min(buf.frames()).min(self.available_to_write());
        if count == 0 {
            return 0;
        }

        let layout = buf.layout();
        let pushed = match (&mut self.inner, buf.data()) {
            (ProducerHalf::S16(p), SampleData::S16(s)) => push_frames(p, s, layout, count),
            (ProducerHalf::S32(p), SampleData::S32(s)) => push_frames(p, s, layout, count),
            (ProducerHalf::F32(p), SampleData::F32(s)) => push_frames(p, s, layout, count),
            (ProducerHalf::F64(p), SampleData::F64(s)) => push_frames(p, s, layout, count),
            _ => 0,
        };
        self.cursors
            .written
            .fetch_add(pushed as u64, Ordering::Release);
        pushed
    }

    /// Mark every frame written so far as stale.
    ///
    /// The consumer skips them at its next `read` or `apply_pending_flush`.
    pub fn request_flush(&self) {
        let written = self.cursors.written.load(Ordering::Relaxed);
        self.cursors.flush_target.store(written, Ordering::Relaxed);
        self.cursors.flush_requested.store(true, Ordering::Release);
    }

    /// Whether the consumer still has to apply a flush.
    pub fn flush_pending(&self) -> bool {
        self.cursors.flush_requested.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RingProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingProducer")
            .field("capacity", &self.capacity)
            .field("available_to_read", &self.available_to_read())
            .field("flush_pending", &self.flush_pending())
            .finish()
    }
}

/// Reading half, owned by the render callback.
pub struct RingConsumer {
    format: AudioFormat,
    capacity: usize,
    channels: usize,
    inner: ConsumerHalf,
    cursors: Arc<Cursors>,
}

impl RingConsumer {
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames the consumer can read right now.
    pub fn available_to_read(&self) -> usize {
        self.cursors.queued().min(self.capacity)
    }

    pub fn available_to_write(&self) -> usize {
        self.capacity - self.available_to_read()
    }

    /// Fill fraction (0.0 to 1.0).
    pub fn fill_level(&self) -> f32 {
        self.available_to_read() as f32 / self.capacity as f32
    }

    pub fn is_empty(&self) -> bool {
        self.available_to_read() == 0
    }

    pub fn is_full(&self) -> bool {
        self.available_to_read() == self.capacity
    }

    /// Copy up to `frames` frames out of the ring into `buf`, starting at
    /// frame 0, and set `buf.frames()` to the count.
    ///
    /// Applies a pending flush first. Returns 0 when the ring is empty or
    /// `buf` is in a different format.
    pub fn read(&mut self, buf: &mut SampleBuffer, frames: usize) -> usize {
        if !accepts(&self.format, buf) {
            return 0;
        }
        self.apply_pending_flush();

        let count = frames.min(buf.capacity()).min(self.available_to_read());
        if count == 0 {
            buf.clear();
            return 0;
        }

        let layout = buf.layout();
        let popped = match (&mut self.inner, buf.data_mut()) {
            (ConsumerHalf::S16(c), SampleData::S16(d)) => pop_frames(c, d, layout, count),
            (ConsumerHalf::S32(c), SampleData::S32(d)) => pop_frames(c, d, layout, count),
            (ConsumerHalf::F32(c), SampleData::F32(d)) => pop_frames(c, d, layout, count),
            (ConsumerHalf::F64(c), SampleData::F64(d)) => pop_frames(c, d, layout, count),
            _ => 0,
        };
        self.cursors
            .consumed
            .fetch_add(popped as u64, Ordering::Release);
        buf.set_frames(popped);
        popped
    }

    pub fn flush_pending(&self) -> bool {
        self.cursors.flush_requested.load(Ordering::Acquire)
    }

    /// Apply a requested flush by skipping the stale frames.
    ///
    /// Returns `true` if a flush was applied.
    pub fn apply_pending_flush(&mut self) -> bool {
        if !self.cursors.flush_requested.swap(false, Ordering::AcqRel) {
            return false;
        }
        let target = self.cursors.flush_target.load(Ordering::Relaxed);
        let consumed = self.cursors.consumed.load(Ordering::Relaxed);
        let stale = (target.saturating_sub(consumed) as usize).min(self.available_to_read());
        let samples = stale * self.channels;
        let skipped = with_half!(&mut self.inner, ConsumerHalf, c => c.skip(samples)) / self.channels;
        self.cursors
            .consumed
            .fetch_add(skipped as u64, Ordering::Release);
        true
    }
}

impl std::fmt::Debug for RingConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingConsumer")
            .field("capacity", &self.capacity)
            .field("available_to_read", &self.available_to_read())
            .field("flush_pending", &self.flush_pending())
            .finish()
    }
}

/// Push `count` whole frames; the caller checked there is room for them.
fn push_frames<T: Copy>(
    producer: &mut HeapProd<T>,
    src: &[T],
    layout: UnitLayout,
    count: usize,
) -> usize {
    let channels = layout.channels;
    if layout.interleaved {
        return producer.push_slice(&src[..count * channels]) / channels;
    }
    for frame in 0..count {
        for channel in 0..channels {
            if producer.try_push(src[layout.index(frame, channel)]).is_err() {
                return frame;
            }
        }
    }
    count
}

/// Pop `count` whole frames; the caller checked they are queued.
fn pop_frames<T: Copy>(
    consumer: &mut HeapCons<T>,
    dst: &mut [T],
    layout: UnitLayout,
    count: usize,
) -> usize {
    let channels = layout.channels;
    if layout.interleaved {
        return consumer.pop_slice(&mut dst[..count * channels]) / channels;
    }
    for frame in 0..count {
        for channel in 0..channels {
            match consumer.try_pop() {
                Some(sample) => dst[layout.index(frame, channel)] = sample,
                None => return frame,
            }
        }
    }
    count
}
