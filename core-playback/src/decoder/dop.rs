//! # DSD over PCM
//!
//! Packs a DSD bitstream into 24-bit PCM frames so it can cross transports
//! that only carry PCM. Each output sample holds a marker byte and two DSD
//! bytes of one channel:
//!
//! ```text
//! bit  23 ........ 16 15 ........ 8 7 .......... 0
//!      |   marker    |  older byte  |  newer byte  |
//! ```
//!
//! Markers alternate `0x05` / `0xFA` frame by frame. The output rate is the
//! DSD bit rate divided by 16.

use super::{check_output_buffer, ensure_open, open_if_needed, require_dsd, Decoder, DecoderState};
use crate::buffer::SampleBuffer;
use crate::error::{PlaybackError, Result, SeekError};
use crate::format::{AudioFormat, SampleFormat, DSD_FRAMES_PER_BYTE};
use tracing::{debug, instrument};

/// Marker carried by even DoP frames.
pub const DOP_MARKER_EVEN: u8 = 0x05;
/// Marker carried by odd DoP frames.
pub const DOP_MARKER_ODD: u8 = 0xFA;

/// DSD frames (bits) carried per channel by one DoP frame.
pub const DSD_FRAMES_PER_DOP_FRAME: usize = 2 * DSD_FRAMES_PER_BYTE;

const SCRATCH_BYTES: usize = 2048;

/// Marker for an absolute DoP frame index.
pub fn marker_for(frame: u64) -> u8 {
    if frame % 2 == 0 {
        DOP_MARKER_EVEN
    } else {
        DOP_MARKER_ODD
    }
}

/// Build a sign-extended 24-bit DoP sample.
pub fn pack(marker: u8, older: u8, newer: u8) -> i32 {
    let raw = (marker as u32) << 16 | (older as u32) << 8 | newer as u32;
    ((raw << 8) as i32) >> 8
}

/// Split a DoP sample into `(marker, older, newer)`.
///
/// Returns `None` when the marker byte is not a DoP marker.
pub fn unpack(sample: i32) -> Option<(u8, u8, u8)> {
    let marker = (sample >> 16) as u8;
    if !DopDecoder::<()>::is_dop_marker(marker) {
        return None;
    }
    Some((marker, (sample >> 8) as u8, sample as u8))
}

/// Frames a DSD stream as DoP (S24 at `dsd_rate / 16`).
pub struct DopDecoder<D> {
    inner: D,
    state: DecoderState,
    output: Option<AudioFormat>,
    scratch: Option<SampleBuffer>,
    /// Older byte per channel waiting for its partner.
    carry: Vec<u8>,
    has_carry: bool,
    position: u64,
}

impl<D> DopDecoder<D> {
    pub fn is_dop_marker(marker: u8) -> bool {
        marker == DOP_MARKER_EVEN || marker == DOP_MARKER_ODD
    }
}

impl<D: Decoder> DopDecoder<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            state: DecoderState::Unopened,
            output: None,
            scratch: None,
            carry: Vec::new(),
            has_carry: false,
            position: 0,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn emit(&self, buf: &mut SampleBuffer, frame: usize, newer: impl Fn(usize) -> u8) {
        let marker = marker_for(self.position + frame as u64);
        for (channel, older) in self.carry.iter().enumerate() {
            buf.set_raw_int(frame, channel, pack(marker, *older, newer(channel)));
        }
    }
}

impl<D: Decoder> Decoder for DopDecoder<D> {
    #[instrument(skip(self))]
    fn open(&mut self) -> Result<()> {
        open_if_needed(&mut self.inner)?;
        let source = self.inner.format()?.clone();
        require_dsd(&source, "DoP framing")?;

        let mut output = AudioFormat::pcm(
            source.sample_rate / DSD_FRAMES_PER_DOP_FRAME as f64,
            source.channels,
            SampleFormat::S24,
            source.interleaved,
        );
        output.layout = source.layout.clone();

        debug!(
            dsd_rate = source.sample_rate,
            dop_rate = output.sample_rate,
            channels = source.channels,
            "DoP decoder opened"
        );

        self.scratch = Some(SampleBuffer::new(
            source.clone(),
            SCRATCH_BYTES * DSD_FRAMES_PER_BYTE,
        ));
        self.carry = vec![0; source.channels as usize];
        self.has_carry = false;
        self.output = Some(output);
        self.position = self.inner.frame_position() / DSD_FRAMES_PER_DOP_FRAME as u64;
        self.state = DecoderState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == DecoderState::Closed {
            return Ok(());
        }
        self.state = DecoderState::Closed;
        self.scratch = None;
        self.inner.close()
    }

    fn state(&self) -> DecoderState {
        self.state
    }

    fn format(&self) -> Result<&AudioFormat> {
        ensure_open(self.state, "query the format of")?;
        self.output
            .as_ref()
            .ok_or_else(|| PlaybackError::Internal("open decoder without format".to_string()))
    }

    fn decode(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> Result<usize> {
        ensure_open(self.state, "decode from")?;
        check_output_buffer(self.format()?, buf)?;

        let mut scratch = self
            .scratch
            .take()
            .ok_or_else(|| PlaybackError::Internal("DoP scratch buffer missing".to_string()))?;
        let target = max_frames.min(buf.capacity());
        let channels = buf.channels();
        let mut produced = 0;

        let result = loop {
            if produced >= target {
                break Ok(());
            }
            let needed = 2 * (target - produced) - usize::from(self.has_carry);
            let want = needed.min(SCRATCH_BYTES) * DSD_FRAMES_PER_BYTE;
            let bits = match self.inner.decode(&mut scratch, want) {
                Ok(bits) => bits,
                Err(e) => break Err(e),
            };

            if bits == 0 {
                // Odd trailing byte: pad the newer half with zero bits.
                if self.has_carry {
                    self.emit(buf, produced, |_| 0);
                    self.has_carry = false;
                    produced += 1;
                }
                break Ok(());
            }

            for byte_frame in 0..bits.div_ceil(DSD_FRAMES_PER_BYTE) {
                if self.has_carry {
                    self.emit(buf, produced, |channel| {
                        scratch.dsd_byte(byte_frame, channel).unwrap_or(0)
                    });
                    self.has_carry = false;
                    produced += 1;
                } else {
                    for channel in 0..channels {
                        self.carry[channel] = scratch.dsd_byte(byte_frame, channel).unwrap_or(0);
                    }
                    self.has_carry = true;
                }
            }
        };
        self.scratch = Some(scratch);
        result?;

        buf.set_frames(produced);
        self.position += produced as u64;
        self.state = if produced == 0 {
            DecoderState::AtEnd
        } else {
            DecoderState::Decoding
        };
        Ok(produced)
    }

    #[instrument(skip(self))]
    fn seek(&mut self, frame: u64) -> Result<()> {
        ensure_open(self.state, "seek")?;
        if !self.inner.supports_seeking() {
            return Err(SeekError::Unsupported.into());
        }

        let upstream_length = self.inner.frame_length();
        if let Some(length) = self.frame_length() {
            if frame > length {
                return Err(SeekError::OutOfRange {
                    frame,
                    length: Some(length),
                }
                .into());
            }
        }

        let mut upstream = frame * DSD_FRAMES_PER_DOP_FRAME as u64;
        if let Some(length) = upstream_length {
            upstream = upstream.min(length);
        }
        self.inner.seek(upstream)?;

        self.has_carry = false;
        self.position = frame;
        self.state = DecoderState::Open;
        Ok(())
    }

    fn supports_seeking(&self) -> bool {
        self.inner.supports_seeking()
    }

    fn frame_position(&self) -> u64 {
        self.position
    }

    fn frame_length(&self) -> Option<u64> {
        self.inner
            .frame_length()
            .map(|bits| bits.div_ceil(DSD_FRAMES_PER_DOP_FRAME as u64))
    }
}
