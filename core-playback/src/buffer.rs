//! # Sample Buffers
//!
//! [`SampleBuffer`] is the caller-owned container every stage of the pipeline
//! reads from or writes into. Storage is allocated once at construction;
//! nothing in this module allocates afterwards.
//!
//! ## Layout
//!
//! Samples are addressed in *units*: one PCM sample, or one byte holding
//! eight DSD frames of a single channel.
//!
//! - Interleaved: `unit * channels + channel`
//! - Planar: `channel * stride + unit`, where `stride` is the capacity in units

use crate::error::{PlaybackError, Result};
use crate::format::{AudioFormat, SampleFormat, DSD_FRAMES_PER_BYTE};
use symphonia::core::conv::FromSample;

/// DSD idle pattern (equal density of ones and zeros).
pub const DSD_SILENCE_BYTE: u8 = 0x69;

/// Typed backing storage of a [`SampleBuffer`].
///
/// 24-bit samples live in the `S32` variant, right-justified and
/// sign-extended.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    Dsd(Vec<u8>),
    S16(Vec<i16>),
    S32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! with_storage {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            SampleData::Dsd($v) => $body,
            SampleData::S16($v) => $body,
            SampleData::S32($v) => $body,
            SampleData::F32($v) => $body,
            SampleData::F64($v) => $body,
        }
    };
}

impl SampleData {
    fn allocate(sample_format: SampleFormat, len: usize) -> Self {
        match sample_format {
            SampleFormat::Dsd => SampleData::Dsd(vec![DSD_SILENCE_BYTE; len]),
            SampleFormat::S16 => SampleData::S16(vec![0; len]),
            SampleFormat::S24 | SampleFormat::S32 => SampleData::S32(vec![0; len]),
            SampleFormat::F32 => SampleData::F32(vec![0.0; len]),
            SampleFormat::F64 => SampleData::F64(vec![0.0; len]),
        }
    }

    /// Number of stored units.
    pub fn len(&self) -> usize {
        with_storage!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(&self, sample_format: SampleFormat) -> bool {
        matches!(
            (self, sample_format),
            (SampleData::Dsd(_), SampleFormat::Dsd)
                | (SampleData::S16(_), SampleFormat::S16)
                | (SampleData::S32(_), SampleFormat::S24 | SampleFormat::S32)
                | (SampleData::F32(_), SampleFormat::F32)
                | (SampleData::F64(_), SampleFormat::F64)
        )
    }
}

/// Addressing parameters of a buffer, copied out so storage can be borrowed
/// mutably while indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitLayout {
    pub channels: usize,
    pub stride: usize,
    pub interleaved: bool,
}

impl UnitLayout {
    #[inline]
    pub fn index(&self, unit: usize, channel: usize) -> usize {
        if self.interleaved {
            unit * self.channels + channel
        } else {
            channel * self.stride + unit
        }
    }
}

/// Fixed-capacity buffer of audio frames in a single [`AudioFormat`].
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    format: AudioFormat,
    capacity: usize,
    frames: usize,
    data: SampleData,
}

impl SampleBuffer {
    /// Allocate a buffer for up to `capacity` frames.
    ///
    /// DSD capacities are rounded up to a whole byte per channel.
    pub fn new(format: AudioFormat, capacity: usize) -> Self {
        let frames_per_unit = frames_per_unit(&format);
        let units = capacity.div_ceil(frames_per_unit);
        let data = SampleData::allocate(format.sample_format, units * format.channels as usize);

        Self {
            capacity: units * frames_per_unit,
            format,
            frames: 0,
            data,
        }
    }

    /// Wrap existing storage. Every stored frame counts as valid.
    pub fn from_data(format: AudioFormat, data: SampleData) -> Result<Self> {
        format.validate()?;
        if !data.matches(format.sample_format) {
            return Err(PlaybackError::Format(format!(
                "storage does not hold {:?} samples",
                format.sample_format
            )));
        }

        let channels = format.channels as usize;
        if data.len() % channels != 0 {
            return Err(PlaybackError::Format(format!(
                "{} samples do not divide into {} channels",
                data.len(),
                channels
            )));
        }

        let capacity = data.len() / channels * frames_per_unit(&format);
        Ok(Self {
            format,
            capacity,
            frames: capacity,
            data,
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn channels(&self) -> usize {
        self.format.channels as usize
    }

    /// Maximum number of frames the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Free frames after the valid region.
    pub fn remaining(&self) -> usize {
        self.capacity - self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Set the valid frame count, clamped to capacity.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity);
    }

    /// Mark the buffer empty without touching storage.
    pub fn clear(&mut self) {
        self.frames = 0;
    }

    /// Distance between channel planes in units (equals capacity for PCM,
    /// capacity / 8 for DSD).
    pub fn stride(&self) -> usize {
        self.capacity / frames_per_unit(&self.format)
    }

    pub fn data(&self) -> &SampleData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut SampleData {
        &mut self.data
    }

    pub(crate) fn layout(&self) -> UnitLayout {
        UnitLayout {
            channels: self.channels(),
            stride: self.stride(),
            interleaved: self.format.interleaved,
        }
    }

    /// Read one sample as a normalized `f64`.
    ///
    /// DSD bits read as `+1.0` / `-1.0`.
    pub fn sample(&self, frame: usize, channel: usize) -> f64 {
        let layout = self.layout();
        match &self.data {
            SampleData::Dsd(bytes) => {
                let byte = bytes[layout.index(frame / DSD_FRAMES_PER_BYTE, channel)];
                if dsd_bit(byte, frame % DSD_FRAMES_PER_BYTE) {
                    1.0
                } else {
                    -1.0
                }
            }
            SampleData::S16(v) => f64::from_sample(v[layout.index(frame, channel)]),
            SampleData::S32(v) => {
                let raw = v[layout.index(frame, channel)];
                if self.format.sample_format == SampleFormat::S24 {
                    f64::from_sample(raw << 8)
                } else {
                    f64::from_sample(raw)
                }
            }
            SampleData::F32(v) => v[layout.index(frame, channel)] as f64,
            SampleData::F64(v) => v[layout.index(frame, channel)],
        }
    }

    /// Store a normalized `f64`, converting to the buffer's encoding.
    ///
    /// For DSD the bit is set when `value >= 0.0`.
    pub fn set_sample(&mut self, frame: usize, channel: usize, value: f64) {
        let layout = self.layout();
        let is_s24 = self.format.sample_format == SampleFormat::S24;
        match &mut self.data {
            SampleData::Dsd(bytes) => {
                let byte = &mut bytes[layout.index(frame / DSD_FRAMES_PER_BYTE, channel)];
                let mask = 0x80u8 >> (frame % DSD_FRAMES_PER_BYTE);
                if value >= 0.0 {
                    *byte |= mask;
                } else {
                    *byte &= !mask;
                }
            }
            SampleData::S16(v) => v[layout.index(frame, channel)] = i16::from_sample(value),
            SampleData::S32(v) => {
                let sample = i32::from_sample(value);
                v[layout.index(frame, channel)] = if is_s24 { sample >> 8 } else { sample };
            }
            SampleData::F32(v) => v[layout.index(frame, channel)] = value as f32,
            SampleData::F64(v) => v[layout.index(frame, channel)] = value,
        }
    }

    /// Raw integer sample (PCM integer formats only).
    pub fn raw_int(&self, frame: usize, channel: usize) -> Option<i32> {
        let index = self.layout().index(frame, channel);
        match &self.data {
            SampleData::S16(v) => Some(v[index] as i32),
            SampleData::S32(v) => Some(v[index]),
            _ => None,
        }
    }

    /// Store a raw integer sample (PCM integer formats only).
    pub fn set_raw_int(&mut self, frame: usize, channel: usize, value: i32) {
        let index = self.layout().index(frame, channel);
        match &mut self.data {
            SampleData::S16(v) => v[index] = value as i16,
            SampleData::S32(v) => v[index] = value,
            _ => {}
        }
    }

    /// One packed DSD byte (frames `byte_frame * 8 ..`).
    pub fn dsd_byte(&self, byte_frame: usize, channel: usize) -> Option<u8> {
        let index = self.layout().index(byte_frame, channel);
        match &self.data {
            SampleData::Dsd(bytes) => bytes.get(index).copied(),
            _ => None,
        }
    }

    pub fn set_dsd_byte(&mut self, byte_frame: usize, channel: usize, byte: u8) {
        let index = self.layout().index(byte_frame, channel);
        if let SampleData::Dsd(bytes) = &mut self.data {
            bytes[index] = byte;
        }
    }

    /// Overwrite frames `[start, start + count)` with silence.
    ///
    /// Does not change the valid frame count.
    pub fn fill_silence(&mut self, start: usize, count: usize) {
        let frames_per_unit = frames_per_unit(&self.format);
        let end = (start + count).min(self.capacity);
        if start >= end {
            return;
        }
        let first = start / frames_per_unit;
        let last = end.div_ceil(frames_per_unit);
        let layout = self.layout();

        match &mut self.data {
            SampleData::Dsd(v) => fill_units(v, layout, first, last, DSD_SILENCE_BYTE),
            SampleData::S16(v) => fill_units(v, layout, first, last, 0),
            SampleData::S32(v) => fill_units(v, layout, first, last, 0),
            SampleData::F32(v) => fill_units(v, layout, first, last, 0.0),
            SampleData::F64(v) => fill_units(v, layout, first, last, 0.0),
        }
    }

    /// Drop the first `count` valid frames and move the rest to the front.
    pub fn discard_front(&mut self, count: usize) {
        let count = count.min(self.frames);
        if count == 0 {
            return;
        }
        if count == self.frames {
            self.frames = 0;
            return;
        }

        let frames_per_unit = frames_per_unit(&self.format);
        let skip = count / frames_per_unit;
        let keep = self.frames.div_ceil(frames_per_unit) - skip;
        let layout = self.layout();

        with_storage!(&mut self.data, v => {
            if layout.interleaved {
                let start = skip * layout.channels;
                v.copy_within(start..start + keep * layout.channels, 0);
            } else {
                for channel in 0..layout.channels {
                    let base = channel * layout.stride;
                    v.copy_within(base + skip..base + skip + keep, base);
                }
            }
        });

        self.frames -= skip * frames_per_unit;
    }

    /// Copy `count` frames from `src` (starting at `src_start`) into this
    /// buffer at `dst_start`.
    ///
    /// Both buffers must share sample format and channel count; storage
    /// layouts may differ. DSD positions must be byte aligned. The valid
    /// frame count of `self` is left unchanged.
    pub fn copy_frames_from(
        &mut self,
        src: &SampleBuffer,
        src_start: usize,
        dst_start: usize,
        count: usize,
    ) -> Result<()> {
        if src.format.sample_format != self.format.sample_format
            || src.format.channels != self.format.channels
        {
            return Err(PlaybackError::Format(format!(
                "cannot copy {:?}x{} frames into {:?}x{} buffer",
                src.format.sample_format,
                src.format.channels,
                self.format.sample_format,
                self.format.channels
            )));
        }
        if src_start + count > src.capacity || dst_start + count > self.capacity {
            return Err(PlaybackError::Internal(format!(
                "frame copy out of bounds: src {}+{} of {}, dst {}+{} of {}",
                src_start, count, src.capacity, dst_start, count, self.capacity
            )));
        }

        let frames_per_unit = frames_per_unit(&self.format);
        if frames_per_unit > 1
            && (src_start % frames_per_unit != 0
                || dst_start % frames_per_unit != 0
                || count % frames_per_unit != 0)
        {
            return Err(PlaybackError::Format(
                "DSD copies must be byte aligned".to_string(),
            ));
        }

        let src_unit = src_start / frames_per_unit;
        let dst_unit = dst_start / frames_per_unit;
        let units = count / frames_per_unit;
        let src_layout = src.layout();
        let dst_layout = self.layout();

        match (&src.data, &mut self.data) {
            (SampleData::Dsd(s), SampleData::Dsd(d)) => {
                copy_units(s, src_layout, src_unit, d, dst_layout, dst_unit, units)
            }
            (SampleData::S16(s), SampleData::S16(d)) => {
                copy_units(s, src_layout, src_unit, d, dst_layout, dst_unit, units)
            }
            (SampleData::S32(s), SampleData::S32(d)) => {
                copy_units(s, src_layout, src_unit, d, dst_layout, dst_unit, units)
            }
            (SampleData::F32(s), SampleData::F32(d)) => {
                copy_units(s, src_layout, src_unit, d, dst_layout, dst_unit, units)
            }
            (SampleData::F64(s), SampleData::F64(d)) => {
                copy_units(s, src_layout, src_unit, d, dst_layout, dst_unit, units)
            }
            _ => {
                return Err(PlaybackError::Internal(
                    "sample storage does not match format".to_string(),
                ))
            }
        }

        Ok(())
    }
}

/// Frames per storage unit: 8 for DSD, 1 for PCM.
pub(crate) fn frames_per_unit(format: &AudioFormat) -> usize {
    if format.is_dsd() {
        DSD_FRAMES_PER_BYTE
    } else {
        1
    }
}

/// Bit for frame `offset` (0 = MSB) of a packed DSD byte.
#[inline]
pub(crate) fn dsd_bit(byte: u8, offset: usize) -> bool {
    byte & (0x80 >> offset) != 0
}

fn fill_units<T: Copy>(v: &mut [T], layout: UnitLayout, first: usize, last: usize, value: T) {
    if layout.interleaved {
        v[first * layout.channels..last * layout.channels].fill(value);
    } else {
        for channel in 0..layout.channels {
            let base = channel * layout.stride;
            v[base + first..base + last].fill(value);
        }
    }
}

fn copy_units<T: Copy>(
    src: &[T],
    src_layout: UnitLayout,
    src_unit: usize,
    dst: &mut [T],
    dst_layout: UnitLayout,
    dst_unit: usize,
    units: usize,
) {
    if src_layout.interleaved && dst_layout.interleaved {
        let channels = src_layout.channels;
        dst[dst_unit * channels..(dst_unit + units) * channels]
            .copy_from_slice(&src[src_unit * channels..(src_unit + units) * channels]);
        return;
    }

    if !src_layout.interleaved && !dst_layout.interleaved {
        for channel in 0..src_layout.channels {
            let s = channel * src_layout.stride + src_unit;
            let d = channel * dst_layout.stride + dst_unit;
            dst[d..d + units].copy_from_slice(&src[s..s + units]);
        }
        return;
    }

    for unit in 0..units {
        for channel in 0..src_layout.channels {
            dst[dst_layout.index(dst_unit + unit, channel)] =
                src[src_layout.index(src_unit + unit, channel)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_f32(interleaved: bool) -> AudioFormat {
        AudioFormat::pcm(48_000.0, 2, SampleFormat::F32, interleaved)
    }

    #[test]
    fn test_dsd_capacity_rounds_up() {
        let buffer = SampleBuffer::new(AudioFormat::dsd(2_822_400.0, 2), 13);
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.stride(), 2);
        assert_eq!(buffer.data().len(), 4);
    }

    #[test]
    fn test_planar_stride_equals_capacity() {
        let mut buffer = SampleBuffer::new(stereo_f32(false), 4);
        assert_eq!(buffer.stride(), 4);

        buffer.set_sample(1, 1, 0.5);
        match buffer.data() {
            SampleData::F32(v) => assert_eq!(v[5], 0.5),
            other => panic!("unexpected storage {:?}", other),
        }
    }

    #[test]
    fn test_s24_sample_round_trip() {
        let format = AudioFormat::pcm(48_000.0, 1, SampleFormat::S24, true);
        let mut buffer = SampleBuffer::new(format, 2);

        buffer.set_sample(0, 0, -1.0);
        buffer.set_sample(1, 0, 0.5);
        assert_eq!(buffer.raw_int(0, 0), Some(-0x80_0000));
        assert_eq!(buffer.raw_int(1, 0), Some(0x40_0000));
        assert!((buffer.sample(1, 0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_dsd_bits_msb_first() {
        let mut buffer = SampleBuffer::new(AudioFormat::dsd(2_822_400.0, 1), 8);
        buffer.set_dsd_byte(0, 0, 0b1000_0001);

        assert_eq!(buffer.sample(0, 0), 1.0);
        assert_eq!(buffer.sample(1, 0), -1.0);
        assert_eq!(buffer.sample(7, 0), 1.0);

        buffer.set_sample(1, 0, 0.3);
        assert_eq!(buffer.dsd_byte(0, 0), Some(0b1100_0001));
    }

    #[test]
    fn test_discard_front_planar() {
        let mut buffer = SampleBuffer::new(stereo_f32(false), 4);
        for frame in 0..4 {
            buffer.set_sample(frame, 0, frame as f64 / 10.0);
            buffer.set_sample(frame, 1, -(frame as f64) / 10.0);
        }
        buffer.set_frames(4);

        buffer.discard_front(3);
        assert_eq!(buffer.frames(), 1);
        assert!((buffer.sample(0, 0) - 0.3).abs() < 1e-6);
        assert!((buffer.sample(0, 1) + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_copy_between_layouts() {
        let mut src = SampleBuffer::new(stereo_f32(true), 3);
        for frame in 0..3 {
            src.set_sample(frame, 0, 0.1 * frame as f64);
            src.set_sample(frame, 1, 0.2 * frame as f64);
        }
        src.set_frames(3);

        let mut dst = SampleBuffer::new(stereo_f32(false), 4);
        dst.copy_frames_from(&src, 1, 2, 2).unwrap();
        assert!((dst.sample(2, 0) - 0.1).abs() < 1e-6);
        assert!((dst.sample(3, 1) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_copy_rejects_format_mismatch() {
        let src = SampleBuffer::new(stereo_f32(true), 4);
        let mut dst = SampleBuffer::new(AudioFormat::cd_quality(), 4);
        assert!(dst.copy_frames_from(&src, 0, 0, 4).is_err());
    }

    #[test]
    fn test_fill_silence() {
        let mut buffer = SampleBuffer::from_data(
            AudioFormat::pcm(44_100.0, 1, SampleFormat::S16, true),
            SampleData::S16(vec![7, 7, 7, 7]),
        )
        .unwrap();
        buffer.fill_silence(1, 2);
        assert_eq!(buffer.data(), &SampleData::S16(vec![7, 0, 0, 7]));
    }

    #[test]
    fn test_from_data_validates_storage() {
        let result = SampleBuffer::from_data(
            AudioFormat::pcm(44_100.0, 2, SampleFormat::S16, true),
            SampleData::F32(vec![0.0; 4]),
        );
        assert!(result.is_err());

        let odd = SampleBuffer::from_data(
            AudioFormat::pcm(44_100.0, 2, SampleFormat::S16, true),
            SampleData::S16(vec![0; 3]),
        );
        assert!(odd.is_err());
    }
}
