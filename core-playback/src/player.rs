//! # Player Node
//!
//! Drives a decoder chain on a dedicated decode thread and hands converted
//! frames to a real-time render callback through a [`RingBuffer`].
//!
//! ## Architecture
//!
//! ```text
//!  control thread              decode thread                 render callback
//! ┌──────────────┐  play/     ┌──────────────────┐  write   ┌──────────────┐
//! │  PlayerNode  ├──seek/────>│ Converter        ├────────> │   Renderer   │
//! │              │  stop      │  └─ Decoder chain│  ring    │  (read only) │
//! └──────┬───────┘            └────────▲─────────┘          └──────┬───────┘
//!        │ events                      │        signal             │
//!        ▼                             └──────── Semaphore ◄───────┘
//!  PlayerObserver
//! ```
//!
//! The render side owns the ring's consumer half and touches only that, a
//! handful of atomics and the semaphore's `signal`, which never takes the
//! semaphore mutex. Everything that allocates, locks, logs or emits events
//! happens on the control thread or the decode thread.
//!
//! ## Positions
//!
//! Frame positions and lengths are in output frames, i.e. at the node's
//! target sample rate.

use crate::buffer::SampleBuffer;
use crate::config::PlayerConfig;
use crate::converter::Converter;
use crate::decoder::Decoder;
use crate::error::{PlaybackError, Result, SeekError};
use crate::events::{PlayerEvent, PlayerObserver};
use crate::format::AudioFormat;
use crate::ring_buffer::{RingBuffer, RingConsumer, RingProducer};
use crate::semaphore::Semaphore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

/// Marker for an unknown frame length.
const UNKNOWN_LENGTH: u64 = u64::MAX;

/// Transport state of a [`PlayerNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    /// A seek is being applied; the decode loop is held.
    SeekRequested = 3,
    /// `stop` is tearing the session down.
    Stopping = 4,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Playing,
            2 => TransportState::Paused,
            3 => TransportState::SeekRequested,
            4 => TransportState::Stopping,
            _ => TransportState::Stopped,
        }
    }
}

/// State shared between the node, the decode thread and the renderer.
struct Shared {
    semaphore: Semaphore,
    state: AtomicU8,
    stop_requested: AtomicBool,
    decode_finished: AtomicBool,
    /// Missing frames recorded by the renderer, not yet reported.
    pending_underrun: AtomicU64,
    underrun_count: AtomicU64,
    position_base: AtomicU64,
    frames_rendered: AtomicU64,
    frame_length: AtomicU64,
    observer: Arc<dyn PlayerObserver>,
}

impl Shared {
    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: TransportState, to: TransportState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn emit(&self, event: PlayerEvent) {
        self.observer.on_event(event);
    }

    fn report_underruns(&self) {
        let missing = self.pending_underrun.swap(0, Ordering::AcqRel);
        if missing > 0 {
            debug!(missing, "Render underrun");
            self.emit(PlayerEvent::Underrun(missing));
        }
    }

    fn reset_position(&self, frame: u64) {
        self.position_base.store(frame, Ordering::Release);
        self.frames_rendered.store(0, Ordering::Release);
    }
}

/// Result of one decode loop iteration.
enum Step {
    /// Frames moved; iterate again right away.
    Progress,
    /// Ring is full; wait for the renderer.
    Idle,
    /// Source exhausted or failed; nothing left to produce.
    Finished,
}

/// Decoder chain and staging buffer owned by one playback session.
struct DecodeSession {
    converter: Converter,
    scratch: SampleBuffer,
    chunk_frames: usize,
    length: Option<u64>,
    exhausted: bool,
    failure: Option<Arc<PlaybackError>>,
}

impl DecodeSession {
    fn is_done(&self) -> bool {
        self.exhausted || self.failure.is_some()
    }

    fn step(&mut self, shared: &Shared, ring: &mut RingProducer) -> Step {
        if self.scratch.is_empty() && !self.is_done() {
            match self.converter.convert(&mut self.scratch, self.chunk_frames) {
                // A short read ends the stream, or precedes a held-back failure.
                Ok(n) if n < self.chunk_frames => match self.converter.take_deferred_error() {
                    Some(e) => {
                        error!(error = %e, tail = n, "Decoding failed");
                        self.failure = Some(Arc::new(e));
                    }
                    None => {
                        debug!("Decoder reached end of stream");
                        self.exhausted = true;
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Decoding failed");
                    self.scratch.clear();
                    self.failure = Some(Arc::new(e));
                }
            }
        }

        if !self.scratch.is_empty() {
            if self.is_done() && ring.available_to_write() >= self.scratch.frames() {
                // Publish before the last frames so their shortfall is not an underrun.
                shared.decode_finished.store(true, Ordering::Release);
            }
            let written = ring.write(&self.scratch, self.scratch.frames());
            if written == 0 {
                return Step::Idle;
            }
            self.scratch.discard_front(written);
            if !self.scratch.is_empty() || !self.is_done() {
                return Step::Progress;
            }
        }

        if self.is_done() {
            Step::Finished
        } else {
            Step::Progress
        }
    }

    /// Reposition at output `frame`.
    fn seek(&mut self, frame: u64) -> Result<()> {
        if let Some(length) = self.length {
            if frame > length {
                return Err(SeekError::OutOfRange {
                    frame,
                    length: Some(length),
                }
                .into());
            }
        }
        let source_frame = (frame as f64 / self.converter.ratio()).round() as u64;
        self.converter.seek(source_frame)?;
        self.scratch.clear();
        self.exhausted = false;
        self.failure = None;
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.converter.decoder_mut().close() {
            warn!(error = %e, "Failed to close decoder");
        }
    }
}

/// Decode-side state behind the session mutex: the ring's producer half
/// outlives every session, the session lives from `play` to the end.
struct DecodeSlot {
    ring: RingProducer,
    session: Option<DecodeSession>,
}

impl DecodeSlot {
    /// Ring has been read dry and no flush awaits the renderer.
    fn drained(&self) -> bool {
        self.ring.is_empty() && !self.ring.flush_pending()
    }
}

type SessionSlot = Arc<Mutex<DecodeSlot>>;

/// Playback controller.
///
/// Created together with its [`Renderer`] by [`PlayerNode::new`]. All control
/// methods take `&self`, so a node can be shared between control threads
/// behind an `Arc`.
pub struct PlayerNode {
    shared: Arc<Shared>,
    session: SessionSlot,
    thread: Mutex<Option<JoinHandle<()>>>,
    format: AudioFormat,
    config: PlayerConfig,
}

impl PlayerNode {
    /// Create a node rendering `format` and its render handle.
    ///
    /// The ring buffer is allocated here, once, for the node's lifetime.
    #[instrument(skip(config, observer), fields(rate = format.sample_rate, channels = format.channels))]
    pub fn new(
        format: AudioFormat,
        config: PlayerConfig,
        observer: Arc<dyn PlayerObserver>,
    ) -> Result<(Self, Renderer)> {
        config.validate()?;
        let (producer, consumer) =
            RingBuffer::new(format.clone(), config.ring_buffer_frames)?.split();

        let shared = Arc::new(Shared {
            semaphore: Semaphore::new(0),
            state: AtomicU8::new(TransportState::Stopped as u8),
            stop_requested: AtomicBool::new(false),
            decode_finished: AtomicBool::new(false),
            pending_underrun: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            position_base: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            frame_length: AtomicU64::new(UNKNOWN_LENGTH),
            observer,
        });

        info!(
            ring_frames = config.ring_buffer_frames,
            latency_ms = config.ring_latency(format.sample_rate).as_millis() as u64,
            "Player node created"
        );

        let renderer = Renderer {
            shared: Arc::clone(&shared),
            ring: consumer,
        };
        let node = Self {
            shared,
            session: Arc::new(Mutex::new(DecodeSlot {
                ring: producer,
                session: None,
            })),
            thread: Mutex::new(None),
            format,
            config,
        };
        Ok((node, renderer))
    }

    /// Start playing `decoder` from its current position.
    ///
    /// Valid only while stopped.
    #[instrument(skip(self, decoder))]
    pub fn play(&self, decoder: Box<dyn Decoder>) -> Result<()> {
        if self.state() != TransportState::Stopped {
            return Err(PlaybackError::InvalidState(format!(
                "cannot start playback while {:?}",
                self.state()
            )));
        }
        self.join_decode_thread();

        let converter = Converter::new(decoder, self.format.clone(), &self.config.converter)?;
        let length = converter
            .decoder()
            .frame_length()
            .map(|frames| (frames as f64 * converter.ratio()).round() as u64);
        let start = (converter.decoder().frame_position() as f64 * converter.ratio()).round() as u64;

        let session = DecodeSession {
            scratch: SampleBuffer::new(self.format.clone(), self.config.decode_chunk_frames),
            chunk_frames: self.config.decode_chunk_frames,
            converter,
            length,
            exhausted: false,
            failure: None,
        };

        let shared = &self.shared;
        shared.stop_requested.store(false, Ordering::Release);
        shared.decode_finished.store(false, Ordering::Release);
        shared.pending_underrun.store(0, Ordering::Release);
        shared.frame_length.store(length.unwrap_or(UNKNOWN_LENGTH), Ordering::Release);
        shared.reset_position(start);
        shared.semaphore.drain();

        {
            let mut slot = self.session.lock();
            if let Some(mut stale) = slot.session.replace(session) {
                stale.close();
            }
            slot.ring.request_flush();
        }

        if !shared.transition(TransportState::Stopped, TransportState::Playing) {
            self.discard_session();
            return Err(PlaybackError::InvalidState(
                "playback was started concurrently".to_string(),
            ));
        }

        let handle = thread::Builder::new()
            .name(self.config.decode_thread_name.clone())
            .spawn({
                let shared = Arc::clone(&self.shared);
                let session = Arc::clone(&self.session);
                let wait_timeout = self.config.wait_timeout;
                move || decode_loop(shared, session, wait_timeout)
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Failed to spawn decode thread");
                self.discard_session();
                self.shared.set_state(TransportState::Stopped);
                return Err(e.into());
            }
        };
        *self.thread.lock() = Some(handle);

        info!(?length, start, "Playback started");
        self.shared.emit(PlayerEvent::PlaybackStarted);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        if !self
            .shared
            .transition(TransportState::Playing, TransportState::Paused)
        {
            return Err(PlaybackError::InvalidState(format!(
                "cannot pause while {:?}",
                self.state()
            )));
        }
        debug!("Playback paused");
        self.shared.emit(PlayerEvent::PlaybackPaused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if !self
            .shared
            .transition(TransportState::Paused, TransportState::Playing)
        {
            return Err(PlaybackError::InvalidState(format!(
                "cannot resume while {:?}",
                self.state()
            )));
        }
        debug!("Playback resumed");
        self.shared.emit(PlayerEvent::PlaybackStarted);
        Ok(())
    }

    /// Stop playback and release the decoder.
    ///
    /// Does nothing when already stopped.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        loop {
            let current = self.state();
            match current {
                TransportState::Stopped => {
                    self.join_decode_thread();
                    return Ok(());
                }
                TransportState::Stopping => return Ok(()),
                _ => {
                    if self.shared.transition(current, TransportState::Stopping) {
                        break;
                    }
                }
            }
        }

        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.semaphore.signal();
        self.join_decode_thread();

        self.discard_session();
        self.shared.set_state(TransportState::Stopped);

        info!("Playback stopped");
        self.shared.emit(PlayerEvent::PlaybackStopped);
        Ok(())
    }

    /// Move playback to output frame `frame`.
    ///
    /// Valid while playing or paused. The transport returns to its prior
    /// state whether or not the seek succeeds.
    #[instrument(skip(self))]
    pub fn seek(&self, frame: u64) -> Result<()> {
        let prior = self.state();
        if !matches!(prior, TransportState::Playing | TransportState::Paused)
            || !self.shared.transition(prior, TransportState::SeekRequested)
        {
            return Err(PlaybackError::InvalidState(format!(
                "cannot seek while {:?}",
                self.state()
            )));
        }

        let result = {
            let mut slot = self.session.lock();
            let DecodeSlot { ring, session } = &mut *slot;
            match session.as_mut() {
                Some(session) => session.seek(frame).map(|()| {
                    // Decode loop is held by the lock; the ring has no writer.
                    ring.request_flush();
                    self.shared.reset_position(frame);
                    self.shared.decode_finished.store(false, Ordering::Release);
                }),
                None => Err(PlaybackError::InvalidState(
                    "no active playback session".to_string(),
                )),
            }
        };

        self.shared.transition(TransportState::SeekRequested, prior);
        match result {
            Ok(()) => {
                debug!(frame, "Seek completed");
                self.shared.semaphore.signal();
                self.shared.emit(PlayerEvent::SeekCompleted(frame));
                Ok(())
            }
            Err(e) => {
                warn!(frame, error = %e, "Seek failed");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    /// Output frames played since the start of the source.
    pub fn frame_position(&self) -> u64 {
        self.shared.position_base.load(Ordering::Acquire)
            + self.shared.frames_rendered.load(Ordering::Acquire)
    }

    /// Length of the current source in output frames, when known.
    pub fn frame_length(&self) -> Option<u64> {
        match self.shared.frame_length.load(Ordering::Acquire) {
            UNKNOWN_LENGTH => None,
            length => Some(length),
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Render callbacks that ran short since the node was created.
    pub fn underrun_count(&self) -> u64 {
        self.shared.underrun_count.load(Ordering::Acquire)
    }

    /// Close the session and mark everything it queued as stale.
    fn discard_session(&self) {
        let mut slot = self.session.lock();
        if let Some(mut session) = slot.session.take() {
            session.close();
        }
        slot.ring.request_flush();
    }

    fn join_decode_thread(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Called from an observer on the decode thread; it exits on its own.
            return;
        }
        if handle.join().is_err() {
            error!("Decode thread panicked");
        }
    }
}

impl Drop for PlayerNode {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Failed to stop playback on drop");
        }
    }
}

impl std::fmt::Debug for PlayerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerNode")
            .field("state", &self.state())
            .field("format", &self.format)
            .field("position", &self.frame_position())
            .field("underruns", &self.underrun_count())
            .finish()
    }
}

/// Body of the decode thread.
fn decode_loop(shared: Arc<Shared>, session: SessionSlot, wait_timeout: std::time::Duration) {
    debug!("Decode loop started");
    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }
        shared.report_underruns();

        let step = {
            let mut slot = session.lock();
            let DecodeSlot { ring, session } = &mut *slot;
            let Some(active) = session.as_mut() else {
                break;
            };
            active.step(&shared, ring)
        };

        match step {
            Step::Progress => continue,
            Step::Idle => {
                shared.semaphore.wait_timeout(wait_timeout);
            }
            Step::Finished => {
                shared.decode_finished.store(true, Ordering::Release);
                if !session.lock().drained() {
                    shared.semaphore.wait_timeout(wait_timeout);
                    continue;
                }
                if finish(&shared, &session) {
                    break;
                }
            }
        }
    }
    shared.report_underruns();
    debug!("Decode loop exited");
}

/// Move the transport to Stopped after the ring drained.
///
/// Returns `false` when a seek holds the transport and the loop must go on.
fn finish(shared: &Shared, session: &SessionSlot) -> bool {
    let mut slot = session.lock();
    if !slot
        .session
        .as_ref()
        .is_some_and(|s| s.is_done() && s.scratch.is_empty())
    {
        // A seek re-armed the session in between.
        return false;
    }

    let ended = shared.transition(TransportState::Playing, TransportState::Stopped)
        || shared.transition(TransportState::Paused, TransportState::Stopped);
    if !ended {
        return shared.state() != TransportState::SeekRequested;
    }
    let failure = slot.session.take().and_then(|mut finished| {
        finished.close();
        finished.failure
    });
    drop(slot);

    shared.report_underruns();
    match failure {
        Some(cause) => {
            warn!(error = %cause, "Playback stopped by decode error");
            shared.emit(PlayerEvent::DecodeError(cause));
        }
        None => {
            info!("Playback ended");
            shared.emit(PlayerEvent::PlaybackEnded);
        }
    }
    true
}

/// Real-time render handle.
///
/// The single consumer of the node's ring buffer. `render` never allocates,
/// locks, logs or fails, so it can run inside an audio device callback.
pub struct Renderer {
    shared: Arc<Shared>,
    ring: RingConsumer,
}

impl Renderer {
    /// Fill `buf` with `frames` frames (clamped to its capacity).
    ///
    /// Returns how many of them came from the ring; the rest are silence.
    /// Outside of `Playing` the whole block is silence and nothing is
    /// consumed.
    pub fn render(&mut self, buf: &mut SampleBuffer, frames: usize) -> usize {
        let shared = &*self.shared;
        let frames = frames.min(buf.capacity());
        let flushed = self.ring.apply_pending_flush();

        if shared.state() != TransportState::Playing {
            buf.fill_silence(0, frames);
            buf.set_frames(frames);
            if flushed {
                shared.semaphore.signal();
            }
            return 0;
        }

        let got = self.ring.read(buf, frames);
        if got > 0 {
            shared.frames_rendered.fetch_add(got as u64, Ordering::AcqRel);
        }
        if got < frames {
            buf.fill_silence(got, frames - got);
            if !shared.decode_finished.load(Ordering::Acquire) {
                shared
                    .pending_underrun
                    .fetch_add((frames - got) as u64, Ordering::AcqRel);
                shared.underrun_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        buf.set_frames(frames);

        if got > 0 || flushed || got < frames {
            shared.semaphore.signal();
        }
        got
    }

    /// Format the renderer expects in `render` buffers.
    pub fn format(&self) -> &AudioFormat {
        self.ring.format()
    }

    /// Frames buffered ahead of the render position.
    pub fn buffered_frames(&self) -> usize {
        self.ring.available_to_read()
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("state", &self.shared.state())
            .field("buffered", &self.buffered_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleData;
    use crate::decoder::BufferDecoder;
    use crate::events::NullObserver;
    use crate::format::SampleFormat;
    use std::time::{Duration, Instant};

    fn mono_s16() -> AudioFormat {
        AudioFormat::pcm(8_000.0, 1, SampleFormat::S16, true)
    }

    fn ramp(frames: i16) -> Box<dyn Decoder> {
        Box::new(BufferDecoder::new(
            SampleBuffer::from_data(mono_s16(), SampleData::S16((0..frames).collect())).unwrap(),
        ))
    }

    fn small_config() -> PlayerConfig {
        PlayerConfig {
            ring_buffer_frames: 64,
            decode_chunk_frames: 16,
            wait_timeout: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_transport_transitions() {
        let (node, _renderer) =
            PlayerNode::new(mono_s16(), small_config(), Arc::new(NullObserver)).unwrap();
        assert_eq!(node.state(), TransportState::Stopped);
        assert!(matches!(node.pause(), Err(PlaybackError::InvalidState(_))));
        assert!(matches!(node.seek(0), Err(PlaybackError::InvalidState(_))));

        node.play(ramp(1000)).unwrap();
        assert!(node.is_playing());
        assert!(matches!(node.play(ramp(10)), Err(PlaybackError::InvalidState(_))));

        node.pause().unwrap();
        assert_eq!(node.state(), TransportState::Paused);
        node.resume().unwrap();
        node.stop().unwrap();
        assert_eq!(node.state(), TransportState::Stopped);
        node.stop().unwrap();
    }

    #[test]
    fn test_render_silence_when_stopped() {
        let (_node, mut renderer) =
            PlayerNode::new(mono_s16(), small_config(), Arc::new(NullObserver)).unwrap();
        let mut out = SampleBuffer::new(mono_s16(), 32);
        out.set_sample(0, 0, 0.5);
        assert_eq!(renderer.render(&mut out, 32), 0);
        assert_eq!(out.frames(), 32);
        assert_eq!(out.raw_int(0, 0), Some(0));
    }

    #[test]
    fn test_renders_source_in_order() {
        let (node, mut renderer) =
            PlayerNode::new(mono_s16(), small_config(), Arc::new(NullObserver)).unwrap();
        node.play(ramp(200)).unwrap();
        assert_eq!(node.frame_length(), Some(200));

        let mut out = SampleBuffer::new(mono_s16(), 16);
        let mut samples = Vec::new();
        assert!(wait_until(|| {
            let got = renderer.render(&mut out, 16);
            samples.extend((0..got).map(|i| out.raw_int(i, 0).unwrap()));
            node.state() == TransportState::Stopped
        }));
        assert_eq!(samples, (0..200).collect::<Vec<i32>>());
        assert_eq!(node.frame_position(), 200);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PlayerConfig {
            ring_buffer_frames: 0,
            ..Default::default()
        };
        let result = PlayerNode::new(mono_s16(), config, Arc::new(NullObserver));
        assert!(matches!(result, Err(PlaybackError::Config(_))));
    }
}
