//! Region looping decorator.

use super::{check_output_buffer, ensure_open, open_if_needed, Decoder, DecoderState};
use crate::buffer::{frames_per_unit, SampleBuffer};
use crate::error::{PlaybackError, Result, SeekError};
use crate::format::{AudioFormat, FrameRange};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

const LOOP_SCRATCH_FRAMES: usize = 4096;

/// How many times a region plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopMode {
    /// Play the region once.
    Once,
    /// Play the region `n + 1` times.
    Repeat(u32),
    /// Loop until stopped.
    Forever,
}

impl LoopMode {
    /// Total passes, `None` when unbounded.
    pub fn passes(&self) -> Option<u64> {
        match self {
            LoopMode::Once => Some(1),
            LoopMode::Repeat(n) => Some(*n as u64 + 1),
            LoopMode::Forever => None,
        }
    }
}

/// Restricts a decoder to a [`FrameRange`] and repeats it seamlessly.
///
/// Wrapping back to the region start happens inside `decode`, so a single
/// call can return frames from the end of one pass followed by frames from
/// the start of the next.
pub struct LoopableRegionDecoder<D> {
    inner: D,
    region: FrameRange,
    mode: LoopMode,
    state: DecoderState,
    /// Completed passes.
    pass: u64,
    /// Offset inside the current pass.
    offset: u64,
    scratch: Option<SampleBuffer>,
    /// Failure returned by the call after the frames that preceded it.
    deferred: Option<PlaybackError>,
}

impl<D: Decoder> LoopableRegionDecoder<D> {
    pub fn new(inner: D, region: FrameRange, mode: LoopMode) -> Self {
        Self {
            inner,
            region,
            mode,
            state: DecoderState::Unopened,
            pass: 0,
            offset: 0,
            scratch: None,
            deferred: None,
        }
    }

    pub fn region(&self) -> FrameRange {
        self.region
    }

    pub fn mode(&self) -> LoopMode {
        self.mode
    }

    /// Completed passes over the region.
    pub fn completed_passes(&self) -> u64 {
        self.pass
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Rewind to the first pass.
    pub fn reset(&mut self) -> Result<()> {
        self.seek(0)
    }

    fn has_more_passes(&self) -> bool {
        match self.mode.passes() {
            Some(total) => self.pass + 1 < total,
            None => true,
        }
    }

    /// Move the wrapped decoder back to the region start for the next pass.
    fn wrap(&mut self) -> Result<()> {
        if let Err(e) = self.inner.seek(self.region.start) {
            warn!(error = %e, start = self.region.start, "Loop wrap seek failed");
            self.state = DecoderState::AtEnd;
            return Err(match e {
                PlaybackError::Seek(seek) => PlaybackError::Seek(seek),
                other => PlaybackError::Seek(SeekError::Failed(other.to_string())),
            });
        }
        self.pass += 1;
        self.offset = 0;
        Ok(())
    }
}

impl<D: Decoder> Decoder for LoopableRegionDecoder<D> {
    #[instrument(skip(self), fields(start = self.region.start, count = self.region.count))]
    fn open(&mut self) -> Result<()> {
        open_if_needed(&mut self.inner)?;

        if !self.inner.supports_seeking() {
            return Err(PlaybackError::Format(
                "looping requires a seekable source".to_string(),
            ));
        }
        if !self.region.fits_within(self.inner.frame_length()) {
            return Err(PlaybackError::Format(format!(
                "region {}..{} exceeds source length {:?}",
                self.region.start,
                self.region.end(),
                self.inner.frame_length()
            )));
        }

        let format = self.inner.format()?.clone();
        let step = frames_per_unit(&format) as u64;
        if self.region.start % step != 0 || self.region.count % step != 0 {
            return Err(PlaybackError::Format(format!(
                "DSD region {}..{} is not byte aligned",
                self.region.start,
                self.region.end()
            )));
        }

        self.inner.seek(self.region.start)?;
        self.scratch = Some(SampleBuffer::new(format, LOOP_SCRATCH_FRAMES));
        self.pass = 0;
        self.offset = 0;
        self.state = DecoderState::Open;
        debug!(mode = ?self.mode, "Loopable region opened");
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
        self.inner.format()
    }

    fn decode(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> Result<usize> {
        ensure_open(self.state, "decode from")?;
        check_output_buffer(self.inner.format()?, buf)?;

        if let Some(e) = self.deferred.take() {
            buf.clear();
            return Err(e);
        }
        let target = max_frames.min(buf.capacity());
        if self.state == DecoderState::AtEnd || self.region.is_empty() {
            self.state = DecoderState::AtEnd;
            buf.clear();
            return Ok(0);
        }

        let mut produced = 0;
        while produced < target {
            let left_in_pass = self.region.count - self.offset;
            if left_in_pass == 0 {
                if !self.has_more_passes() {
                    break;
                }
                match self.wrap() {
                    Ok(()) => continue,
                    Err(e) if produced > 0 => {
                        self.deferred = Some(e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            let want = ((target - produced) as u64).min(left_in_pass) as usize;
            let got = if produced == 0 {
                self.inner.decode(buf, want)?
            } else {
                // Wrapped decoders write at frame 0, so later chunks go
                // through scratch.
                let scratch = self.scratch.as_mut().ok_or_else(|| {
                    PlaybackError::Internal("loop scratch buffer missing".to_string())
                })?;
                let got = match self.inner.decode(scratch, want.min(scratch.capacity())) {
                    Ok(got) => got,
                    Err(e) => {
                        self.deferred = Some(e);
                        break;
                    }
                };
                let step = frames_per_unit(scratch.format());
                let copy = (got.div_ceil(step) * step).min(buf.capacity() - produced);
                buf.copy_frames_from(scratch, 0, produced, copy)?;
                got
            };

            if got == 0 {
                if self.offset == 0 {
                    // Empty pass; wrapping again would spin.
                    break;
                }
                // Source ended before the region end: treat as region end.
                self.offset = self.region.count;
                continue;
            }
            produced += got;
            self.offset += got as u64;
        }

        buf.set_frames(produced);
        self.state = if produced == 0 || self.deferred.is_some() {
            DecoderState::AtEnd
        } else {
            DecoderState::Decoding
        };
        Ok(produced)
    }

    #[instrument(skip(self))]
    fn seek(&mut self, frame: u64) -> Result<()> {
        ensure_open(self.state, "seek")?;
        if let Some(length) = self.frame_length() {
            if frame > length {
                return Err(SeekError::OutOfRange {
                    frame,
                    length: Some(length),
                }
                .into());
            }
        }

        let (pass, offset) = if self.region.count == 0 {
            (0, 0)
        } else {
            (frame / self.region.count, frame % self.region.count)
        };
        // Exactly at the end of the last pass: park at the region end.
        let (pass, offset) = match self.mode.passes() {
            Some(total) if pass >= total => (total - 1, self.region.count),
            _ => (pass, offset),
        };

        self.inner.seek(self.region.start + offset)?;
        self.deferred = None;
        self.pass = pass;
        self.offset = offset;
        self.state = DecoderState::Open;
        Ok(())
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn frame_position(&self) -> u64 {
        self.pass * self.region.count + self.offset
    }

    fn frame_length(&self) -> Option<u64> {
        self.mode.passes().map(|passes| passes * self.region.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleData;
    use crate::decoder::BufferDecoder;
    use crate::format::SampleFormat;

    fn mono_s16() -> AudioFormat {
        AudioFormat::pcm(44_100.0, 1, SampleFormat::S16, true)
    }

    fn ramp(frames: i16) -> BufferDecoder {
        BufferDecoder::new(
            SampleBuffer::from_data(mono_s16(), SampleData::S16((0..frames).collect())).unwrap(),
        )
    }

    /// Allows `seeks_left` seeks, then fails every one after.
    struct SeekBudget {
        inner: BufferDecoder,
        seeks_left: usize,
    }

    impl Decoder for SeekBudget {
        fn open(&mut self) -> Result<()> {
            self.inner.open()
        }

        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }

        fn state(&self) -> DecoderState {
            self.inner.state()
        }

        fn format(&self) -> Result<&AudioFormat> {
            self.inner.format()
        }

        fn decode(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> Result<usize> {
            self.inner.decode(buf, max_frames)
        }

        fn seek(&mut self, frame: u64) -> Result<()> {
            if self.seeks_left == 0 {
                return Err(PlaybackError::Decode("index unreadable".to_string()));
            }
            self.seeks_left -= 1;
            self.inner.seek(frame)
        }

        fn supports_seeking(&self) -> bool {
            true
        }

        fn frame_position(&self) -> u64 {
            self.inner.frame_position()
        }

        fn frame_length(&self) -> Option<u64> {
            self.inner.frame_length()
        }
    }

    fn collect(decoder: &mut impl Decoder, chunk: usize) -> Vec<i32> {
        let mut out = SampleBuffer::new(mono_s16(), chunk);
        let mut samples = Vec::new();
        loop {
            let n = decoder.decode(&mut out, chunk).unwrap();
            if n == 0 {
                return samples;
            }
            samples.extend((0..n).map(|i| out.raw_int(i, 0).unwrap()));
        }
    }

    #[test]
    fn test_once_plays_region_only() {
        let mut decoder = LoopableRegionDecoder::new(ramp(20), FrameRange::new(5, 4), LoopMode::Once);
        decoder.open().unwrap();
        assert_eq!(decoder.frame_length(), Some(4));
        assert_eq!(collect(&mut decoder, 16), vec![5, 6, 7, 8]);
        assert_eq!(decoder.state(), DecoderState::AtEnd);
    }

    #[test]
    fn test_repeat_wraps_inside_one_call() {
        let mut decoder =
            LoopableRegionDecoder::new(ramp(10), FrameRange::new(2, 3), LoopMode::Repeat(2));
        decoder.open().unwrap();
        assert_eq!(decoder.frame_length(), Some(9));

        let mut out = SampleBuffer::new(mono_s16(), 16);
        assert_eq!(decoder.decode(&mut out, 16).unwrap(), 9);
        let samples: Vec<i32> = (0..9).map(|i| out.raw_int(i, 0).unwrap()).collect();
        assert_eq!(samples, vec![2, 3, 4, 2, 3, 4, 2, 3, 4]);
        assert_eq!(decoder.completed_passes(), 2);
    }

    #[test]
    fn test_forever_has_no_length() {
        let mut decoder =
            LoopableRegionDecoder::new(ramp(4), FrameRange::new(0, 4), LoopMode::Forever);
        decoder.open().unwrap();
        assert_eq!(decoder.frame_length(), None);

        let mut out = SampleBuffer::new(mono_s16(), 10);
        assert_eq!(decoder.decode(&mut out, 10).unwrap(), 10);
        assert_eq!(out.raw_int(9, 0), Some(1));
    }

    #[test]
    fn test_region_past_end_rejected() {
        let mut decoder = LoopableRegionDecoder::new(ramp(4), FrameRange::new(2, 3), LoopMode::Once);
        assert!(decoder.open().unwrap_err().is_format_error());
    }

    #[test]
    fn test_seek_maps_to_pass_and_offset() {
        let mut decoder =
            LoopableRegionDecoder::new(ramp(10), FrameRange::new(4, 4), LoopMode::Repeat(1));
        decoder.open().unwrap();

        decoder.seek(6).unwrap();
        assert_eq!(decoder.completed_passes(), 1);
        assert_eq!(decoder.frame_position(), 6);
        assert_eq!(collect(&mut decoder, 8), vec![6, 7]);

        decoder.reset().unwrap();
        assert_eq!(collect(&mut decoder, 8).len(), 8);

        decoder.seek(8).unwrap();
        assert_eq!(collect(&mut decoder, 8), Vec::<i32>::new());
        assert!(decoder.seek(9).unwrap_err().is_seek_error());
    }

    #[test]
    fn test_failed_wrap_keeps_frames_of_finished_pass() {
        let inner = SeekBudget {
            inner: ramp(10),
            seeks_left: 1,
        };
        let mut decoder =
            LoopableRegionDecoder::new(inner, FrameRange::new(2, 3), LoopMode::Repeat(2));
        decoder.open().unwrap();

        let mut out = SampleBuffer::new(mono_s16(), 16);
        assert_eq!(decoder.decode(&mut out, 16).unwrap(), 3);
        let samples: Vec<i32> = (0..3).map(|i| out.raw_int(i, 0).unwrap()).collect();
        assert_eq!(samples, vec![2, 3, 4]);
        assert_eq!(decoder.state(), DecoderState::AtEnd);

        let err = decoder.decode(&mut out, 16).unwrap_err();
        assert!(err.is_seek_error());
        assert_eq!(out.frames(), 0);
        assert_eq!(decoder.decode(&mut out, 16).unwrap(), 0);
    }
}
