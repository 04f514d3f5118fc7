//! DSD to PCM decimation.
//!
//! Each DSD byte of a channel (8 one-bit frames) yields one F32 frame, so the
//! output rate is the bit rate divided by 8. The low-pass filter is a
//! linear-phase windowed-sinc FIR evaluated eight taps at a time through
//! per-byte lookup tables, which keeps the inner loop at one table read and
//! one add per byte of history.

use super::{check_output_buffer, ensure_open, open_if_needed, require_dsd, Decoder, DecoderState};
use crate::buffer::{SampleBuffer, DSD_SILENCE_BYTE};
use crate::error::{PlaybackError, Result, SeekError};
use crate::format::{AudioFormat, SampleFormat, DSD_FRAMES_PER_BYTE};
use std::f64::consts::PI;
use tracing::{debug, instrument};

/// FIR length in DSD bits.
pub const DSD_FIR_TAPS: usize = 48;

/// Cutoff as a fraction of the output Nyquist frequency.
const CUTOFF_FRACTION: f64 = 0.45;

/// Headroom applied unless overridden.
pub const DEFAULT_GAIN_DB: f64 = -6.0;

const TABLE_GROUPS: usize = DSD_FIR_TAPS / DSD_FRAMES_PER_BYTE;

/// Bytes per channel pulled from the wrapped decoder per iteration.
const SCRATCH_BYTES: usize = 1024;

/// Decimates a DSD stream to F32 PCM at `dsd_rate / 8`.
pub struct DsdPcmDecoder<D> {
    inner: D,
    gain_db: f64,
    state: DecoderState,
    output: Option<AudioFormat>,
    tables: Vec<[f32; 256]>,
    /// Last `TABLE_GROUPS` bytes per channel, newest at `cursor`.
    history: Vec<[u8; TABLE_GROUPS]>,
    cursor: usize,
    scratch: Option<SampleBuffer>,
    position: u64,
    deferred: Option<PlaybackError>,
}

impl<D: Decoder> DsdPcmDecoder<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            gain_db: DEFAULT_GAIN_DB,
            state: DecoderState::Unopened,
            output: None,
            tables: Vec::new(),
            history: Vec::new(),
            cursor: 0,
            scratch: None,
            position: 0,
            deferred: None,
        }
    }

    /// Output gain in dB (applied to the filter coefficients at open).
    pub fn with_gain_db(mut self, gain_db: f64) -> Self {
        self.gain_db = gain_db;
        self
    }

    pub fn gain_db(&self) -> f64 {
        self.gain_db
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn clear_history(&mut self) {
        for channel in &mut self.history {
            *channel = [DSD_SILENCE_BYTE; TABLE_GROUPS];
        }
        self.cursor = 0;
    }

    /// Filtered sample for `channel` over the current history window.
    #[inline]
    fn filter(&self, channel: usize) -> f32 {
        let history = &self.history[channel];
        let mut acc = 0.0f32;
        for (group, table) in self.tables.iter().enumerate() {
            let slot = (self.cursor + TABLE_GROUPS - group) % TABLE_GROUPS;
            acc += table[history[slot] as usize];
        }
        acc
    }
}

impl<D: Decoder> Decoder for DsdPcmDecoder<D> {
    #[instrument(skip(self), fields(gain_db = self.gain_db))]
    fn open(&mut self) -> Result<()> {
        open_if_needed(&mut self.inner)?;
        let source = self.inner.format()?.clone();
        require_dsd(&source, "DSD to PCM conversion")?;

        let channels = source.channels as usize;
        self.tables = build_tables(self.gain_db);
        self.history = vec![[DSD_SILENCE_BYTE; TABLE_GROUPS]; channels];
        self.cursor = 0;
        self.scratch = Some(SampleBuffer::new(
            source.clone(),
            SCRATCH_BYTES * DSD_FRAMES_PER_BYTE,
        ));

        let mut output = AudioFormat::pcm(
            source.sample_rate / DSD_FRAMES_PER_BYTE as f64,
            source.channels,
            SampleFormat::F32,
            source.interleaved,
        );
        output.layout = source.layout.clone();

        debug!(
            dsd_rate = source.sample_rate,
            pcm_rate = output.sample_rate,
            channels,
            "DSD to PCM decoder opened"
        );

        self.output = Some(output);
        self.position = self.inner.frame_position() / DSD_FRAMES_PER_BYTE as u64;
        self.state = DecoderState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == DecoderState::Closed {
            return Ok(());
        }
        self.state = DecoderState::Closed;
        self.scratch = None;
        self.deferred = None;
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
        if let Some(e) = self.deferred.take() {
            buf.clear();
            return Err(e);
        }

        let mut scratch = self
            .scratch
            .take()
            .ok_or_else(|| PlaybackError::Internal("DSD scratch buffer missing".to_string()))?;
        let target = max_frames.min(buf.capacity());
        let channels = buf.channels();
        let mut produced = 0;

        let result = loop {
            if produced >= target {
                break Ok(());
            }
            let want = (target - produced).min(SCRATCH_BYTES) * DSD_FRAMES_PER_BYTE;
            let bits = match self.inner.decode(&mut scratch, want) {
                Ok(bits) => bits,
                Err(e) if produced > 0 => {
                    self.deferred = Some(e);
                    break Ok(());
                }
                Err(e) => break Err(e),
            };
            if bits == 0 {
                break Ok(());
            }

            for byte_frame in 0..bits.div_ceil(DSD_FRAMES_PER_BYTE) {
                self.cursor = (self.cursor + 1) % TABLE_GROUPS;
                for channel in 0..channels {
                    let byte = scratch.dsd_byte(byte_frame, channel).unwrap_or(DSD_SILENCE_BYTE);
                    self.history[channel][self.cursor] = byte;
                    let sample = self.filter(channel);
                    buf.set_sample(produced + byte_frame, channel, sample as f64);
                }
            }
            produced += bits.div_ceil(DSD_FRAMES_PER_BYTE);
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

        let mut upstream = frame * DSD_FRAMES_PER_BYTE as u64;
        if let Some(length) = upstream_length {
            upstream = upstream.min(length);
        }
        self.inner.seek(upstream)?;

        self.clear_history();
        self.deferred = None;
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
            .map(|bits| bits.div_ceil(DSD_FRAMES_PER_BYTE as u64))
    }
}

/// Windowed-sinc low-pass taps, normalized to unity DC gain then scaled.
fn design_taps(gain_db: f64) -> [f64; DSD_FIR_TAPS] {
    // Cycles per DSD sample: output Nyquist is rate / 16.
    let cutoff = CUTOFF_FRACTION / (2.0 * DSD_FRAMES_PER_BYTE as f64);
    let center = (DSD_FIR_TAPS - 1) as f64 / 2.0;
    let span = (DSD_FIR_TAPS - 1) as f64;

    let mut taps = [0.0; DSD_FIR_TAPS];
    for (k, tap) in taps.iter_mut().enumerate() {
        let x = k as f64 - center;
        let sinc = if x == 0.0 {
            2.0 * cutoff
        } else {
            (2.0 * PI * cutoff * x).sin() / (PI * x)
        };
        let phase = 2.0 * PI * k as f64 / span;
        let blackman = 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos();
        *tap = sinc * blackman;
    }

    let sum: f64 = taps.iter().sum();
    let gain = 10f64.powf(gain_db / 20.0);
    for tap in &mut taps {
        *tap = *tap / sum * gain;
    }
    taps
}

/// One 256-entry table per group of eight taps. Entry `b` is the filter
/// contribution of byte `b`, each bit mapped to +1 (set) or -1 (clear).
///
/// Group 0 covers the newest byte. Bits arrive MSB first, so the LSB is the
/// newest bit of its byte and takes the lowest tap of the group.
fn build_tables(gain_db: f64) -> Vec<[f32; 256]> {
    let taps = design_taps(gain_db);
    (0..TABLE_GROUPS)
        .map(|group| {
            let mut table = [0.0f32; 256];
            for (byte, entry) in table.iter_mut().enumerate() {
                let mut acc = 0.0;
                for bit in 0..DSD_FRAMES_PER_BYTE {
                    let tap = taps[group * DSD_FRAMES_PER_BYTE + (DSD_FRAMES_PER_BYTE - 1 - bit)];
                    if byte & (0x80 >> bit) != 0 {
                        acc += tap;
                    } else {
                        acc -= tap;
                    }
                }
                *entry = acc as f32;
            }
            table
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleData;
    use crate::decoder::BufferDecoder;

    fn dsd_source(bytes: Vec<u8>, channels: u16) -> BufferDecoder {
        let format = AudioFormat::dsd(2_822_400.0, channels);
        BufferDecoder::new(SampleBuffer::from_data(format, SampleData::Dsd(bytes)).unwrap())
    }

    #[test]
    fn test_taps_are_symmetric_with_unity_dc() {
        let taps = design_taps(0.0);
        let sum: f64 = taps.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for k in 0..DSD_FIR_TAPS / 2 {
            assert!((taps[k] - taps[DSD_FIR_TAPS - 1 - k]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_output_format() {
        let mut decoder = DsdPcmDecoder::new(dsd_source(vec![DSD_SILENCE_BYTE; 64], 2));
        decoder.open().unwrap();

        let format = decoder.format().unwrap();
        assert_eq!(format.sample_rate, 352_800.0);
        assert_eq!(format.sample_format, SampleFormat::F32);
        assert_eq!(format.channels, 2);
        assert_eq!(decoder.frame_length(), Some(32));
    }

    #[test]
    fn test_all_ones_settles_at_gain() {
        let mut decoder = DsdPcmDecoder::new(dsd_source(vec![0xFF; 64], 1)).with_gain_db(-6.0);
        decoder.open().unwrap();

        let format = decoder.format().unwrap().clone();
        let mut out = SampleBuffer::new(format, 64);
        assert_eq!(decoder.decode(&mut out, 64).unwrap(), 64);

        let expected = 10f64.powf(-6.0 / 20.0);
        assert!((out.sample(63, 0) - expected).abs() < 1e-4);
        assert_eq!(decoder.decode(&mut out, 64).unwrap(), 0);
        assert_eq!(decoder.state(), DecoderState::AtEnd);
    }

    #[test]
    fn test_rejects_pcm_source() {
        let format = AudioFormat::pcm(44_100.0, 1, SampleFormat::S16, true);
        let source = BufferDecoder::new(
            SampleBuffer::from_data(format, SampleData::S16(vec![0; 8])).unwrap(),
        );
        let mut decoder = DsdPcmDecoder::new(source);
        assert!(decoder.open().unwrap_err().is_format_error());
    }

    #[test]
    fn test_seek_maps_to_upstream_bits() {
        let mut decoder = DsdPcmDecoder::new(dsd_source(vec![DSD_SILENCE_BYTE; 32], 1));
        decoder.open().unwrap();

        decoder.seek(10).unwrap();
        assert_eq!(decoder.inner().frame_position(), 80);
        assert_eq!(decoder.frame_position(), 10);

        assert!(decoder.seek(33).unwrap_err().is_seek_error());
    }

    #[test]
    fn test_tables_match_direct_fir() {
        let bytes: Vec<u8> = (0..32u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        let mut decoder = DsdPcmDecoder::new(dsd_source(bytes.clone(), 1)).with_gain_db(0.0);
        decoder.open().unwrap();
        let format = decoder.format().unwrap().clone();
        let mut out = SampleBuffer::new(format, 32);
        assert_eq!(decoder.decode(&mut out, 32).unwrap(), 32);

        // Oldest bit first, starting from the silence the history is primed with.
        let bits: Vec<f64> = std::iter::repeat(DSD_SILENCE_BYTE)
            .take(TABLE_GROUPS)
            .chain(bytes)
            .flat_map(|byte| {
                (0..DSD_FRAMES_PER_BYTE)
                    .map(move |bit| if byte & (0x80 >> bit) != 0 { 1.0 } else { -1.0 })
            })
            .collect();
        let taps = design_taps(0.0);
        for frame in 0..32 {
            let newest = (TABLE_GROUPS + frame + 1) * DSD_FRAMES_PER_BYTE - 1;
            let expected: f64 = (0..DSD_FIR_TAPS).map(|k| taps[k] * bits[newest - k]).sum();
            assert!(
                (out.sample(frame, 0) - expected).abs() < 1e-5,
                "frame {}: {} vs {}",
                frame,
                out.sample(frame, 0),
                expected
            );
        }
    }
}
