//! # Audio Format Types
//!
//! Describes the layout of audio exchanged between decoders, the converter,
//! the ring buffer, and the render callback.

use crate::error::{PlaybackError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of 1-bit DSD frames packed into one byte of a channel.
pub const DSD_FRAMES_PER_BYTE: usize = 8;

// ============================================================================
// Sample Format
// ============================================================================

/// Encoding of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 1-bit delta-sigma bitstream, 8 frames per byte, MSB first.
    Dsd,
    /// 16-bit signed integer
    S16,
    /// 24-bit signed integer, right-justified and sign-extended in an `i32`
    S24,
    /// 32-bit signed integer
    S32,
    /// 32-bit float in `[-1.0, 1.0]`
    F32,
    /// 64-bit float in `[-1.0, 1.0]`
    F64,
}

impl SampleFormat {
    /// Significant bits per sample.
    pub fn bits_per_sample(&self) -> u32 {
        match self {
            SampleFormat::Dsd => 1,
            SampleFormat::S16 => 16,
            SampleFormat::S24 => 24,
            SampleFormat::S32 | SampleFormat::F32 => 32,
            SampleFormat::F64 => 64,
        }
    }

    /// Bytes used to store one sample in memory (`None` for packed DSD).
    pub fn storage_bytes(&self) -> Option<usize> {
        match self {
            SampleFormat::Dsd => None,
            SampleFormat::S16 => Some(2),
            SampleFormat::S24 | SampleFormat::S32 | SampleFormat::F32 => Some(4),
            SampleFormat::F64 => Some(8),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SampleFormat::F32 | SampleFormat::F64)
    }

    pub fn is_pcm(&self) -> bool {
        !matches!(self, SampleFormat::Dsd)
    }
}

/// Broad family of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatKind {
    /// Multi-bit linear PCM
    Pcm,
    /// Bitstream-rate DSD
    Bitstream,
}

// ============================================================================
// Channel Layout
// ============================================================================

/// Channel layout descriptor.
///
/// Only used to check that two formats carry the same channels; the
/// converter never up- or down-mixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    /// L, R, Ls, Rs
    Quad,
    /// L, R, C, LFE, Ls, Rs
    Surround51,
    /// L, R, C, LFE, Ls, Rs, Lrs, Rrs
    Surround71,
    /// Explicit speaker bitmap, one bit per channel present.
    Bitmap(u32),
    /// Unlabelled channels.
    Discrete(u16),
}

impl ChannelLayout {
    /// Conventional layout for a channel count.
    pub fn from_channel_count(channels: u16) -> Self {
        match channels {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            4 => ChannelLayout::Quad,
            6 => ChannelLayout::Surround51,
            8 => ChannelLayout::Surround71,
            n => ChannelLayout::Discrete(n),
        }
    }

    pub fn channel_count(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Quad => 4,
            ChannelLayout::Surround51 => 6,
            ChannelLayout::Surround71 => 8,
            ChannelLayout::Bitmap(bits) => bits.count_ones() as u16,
            ChannelLayout::Discrete(n) => *n,
        }
    }
}

// ============================================================================
// Audio Format
// ============================================================================

/// Complete description of an audio stream's frames.
///
/// A frame is one sample per channel at a given instant. For DSD streams a
/// frame is one bit per channel and `sample_rate` is the bit rate
/// (e.g. 2 822 400 Hz for DSD64).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: f64,
    /// Number of channels.
    pub channels: u16,
    /// Encoding of each sample.
    pub sample_format: SampleFormat,
    /// `true` for interleaved storage (LRLR...), `false` for planar.
    pub interleaved: bool,
    /// Optional channel layout tag.
    #[serde(default)]
    pub layout: Option<ChannelLayout>,
}

impl AudioFormat {
    /// PCM format.
    pub fn pcm(sample_rate: f64, channels: u16, sample_format: SampleFormat, interleaved: bool) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
            interleaved,
            layout: None,
        }
    }

    /// DSD bitstream format (interleaved bytes, MSB first).
    pub fn dsd(sample_rate: f64, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::Dsd,
            interleaved: true,
            layout: None,
        }
    }

    /// Standard CD quality (44.1 kHz, 16-bit interleaved stereo)
    pub fn cd_quality() -> Self {
        Self::pcm(44_100.0, 2, SampleFormat::S16, true)
    }

    /// Attach a channel layout tag.
    pub fn with_layout(mut self, layout: ChannelLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Same format with a different sample encoding.
    pub fn with_sample_format(mut self, sample_format: SampleFormat) -> Self {
        self.sample_format = sample_format;
        self
    }

    /// Same format at a different sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Same format with a different storage layout.
    pub fn with_interleaved(mut self, interleaved: bool) -> Self {
        self.interleaved = interleaved;
        self
    }

    pub fn kind(&self) -> FormatKind {
        if self.sample_format.is_pcm() {
            FormatKind::Pcm
        } else {
            FormatKind::Bitstream
        }
    }

    pub fn is_pcm(&self) -> bool {
        self.kind() == FormatKind::Pcm
    }

    pub fn is_dsd(&self) -> bool {
        self.kind() == FormatKind::Bitstream
    }

    pub fn bits_per_sample(&self) -> u32 {
        self.sample_format.bits_per_sample()
    }

    /// Bytes occupied by one frame in memory (`None` for DSD).
    pub fn bytes_per_frame(&self) -> Option<usize> {
        self.sample_format
            .storage_bytes()
            .map(|bytes| bytes * self.channels as usize)
    }

    /// Playback duration of `frames` frames.
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / self.sample_rate)
    }

    /// Check the invariants every format handed to the pipeline must satisfy.
    pub fn validate(&self) -> Result<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(PlaybackError::Format(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }

        if self.channels == 0 {
            return Err(PlaybackError::Format(
                "channel count must be at least 1".to_string(),
            ));
        }

        if let Some(layout) = &self.layout {
            if layout.channel_count() != self.channels {
                return Err(PlaybackError::Format(format!(
                    "layout {:?} describes {} channels but format has {}",
                    layout,
                    layout.channel_count(),
                    self.channels
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Frame Range
// ============================================================================

/// Half-open range of frames `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: u64,
    pub count: u64,
}

impl FrameRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether the range fits inside a source of `total` frames.
    pub fn fits_within(&self, total: Option<u64>) -> bool {
        match total {
            Some(total) => self.start.checked_add(self.count).is_some_and(|end| end <= total),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_kinds() {
        let pcm = AudioFormat::cd_quality();
        assert!(pcm.is_pcm());
        assert_eq!(pcm.bytes_per_frame(), Some(4));
        assert_eq!(pcm.bits_per_sample(), 16);

        let dsd = AudioFormat::dsd(2_822_400.0, 2);
        assert!(dsd.is_dsd());
        assert_eq!(dsd.kind(), FormatKind::Bitstream);
        assert_eq!(dsd.bytes_per_frame(), None);
    }

    #[test]
    fn test_format_validation() {
        assert!(AudioFormat::cd_quality().validate().is_ok());

        let zero_rate = AudioFormat::pcm(0.0, 2, SampleFormat::F32, true);
        assert!(zero_rate.validate().is_err());

        let no_channels = AudioFormat::pcm(48_000.0, 0, SampleFormat::F32, true);
        assert!(no_channels.validate().is_err());

        let bad_layout = AudioFormat::cd_quality().with_layout(ChannelLayout::Surround51);
        assert!(bad_layout.validate().is_err());

        let good_layout = AudioFormat::cd_quality().with_layout(ChannelLayout::Stereo);
        assert!(good_layout.validate().is_ok());
    }

    #[test]
    fn test_channel_layout_counts() {
        assert_eq!(ChannelLayout::from_channel_count(6), ChannelLayout::Surround51);
        assert_eq!(ChannelLayout::from_channel_count(3), ChannelLayout::Discrete(3));
        assert_eq!(ChannelLayout::Bitmap(0b1011).channel_count(), 3);
    }

    #[test]
    fn test_frame_range() {
        let range = FrameRange::new(100, 50);
        assert_eq!(range.end(), 150);
        assert!(range.fits_within(Some(150)));
        assert!(!range.fits_within(Some(149)));
        assert!(range.fits_within(None));
        assert!(!FrameRange::new(u64::MAX, 2).fits_within(Some(u64::MAX)));
    }

    #[test]
    fn test_duration() {
        let format = AudioFormat::pcm(48_000.0, 2, SampleFormat::F32, true);
        assert_eq!(format.frames_to_duration(24_000).as_millis(), 500);
    }
}
