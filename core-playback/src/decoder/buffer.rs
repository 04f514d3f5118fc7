//! In-memory decoder over a filled [`SampleBuffer`].

use super::{check_output_buffer, ensure_open, Decoder, DecoderState};
use crate::buffer::{frames_per_unit, SampleBuffer};
use crate::error::{PlaybackError, Result, SeekError};
use crate::format::AudioFormat;
use tracing::debug;

/// Serves the valid frames of a [`SampleBuffer`] as a seekable stream.
///
/// Works for every sample format including DSD, which makes it the usual
/// source for generated material, pre-decoded assets and tests.
pub struct BufferDecoder {
    source: SampleBuffer,
    state: DecoderState,
    position: usize,
}

impl BufferDecoder {
    pub fn new(source: SampleBuffer) -> Self {
        Self {
            source,
            state: DecoderState::Unopened,
            position: 0,
        }
    }

    /// Give the wrapped buffer back.
    pub fn into_inner(self) -> SampleBuffer {
        self.source
    }
}

impl Decoder for BufferDecoder {
    fn open(&mut self) -> Result<()> {
        if self.state == DecoderState::Closed {
            return Err(PlaybackError::InvalidState(
                "cannot reopen a closed buffer decoder".to_string(),
            ));
        }
        self.source.format().validate()?;
        self.position = 0;
        self.state = DecoderState::Open;
        debug!(
            frames = self.source.frames(),
            format = ?self.source.format().sample_format,
            "Buffer decoder opened"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state = DecoderState::Closed;
        Ok(())
    }

    fn state(&self) -> DecoderState {
        self.state
    }

    fn format(&self) -> Result<&AudioFormat> {
        ensure_open(self.state, "query the format of")?;
        Ok(self.source.format())
    }

    fn decode(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> Result<usize> {
        ensure_open(self.state, "decode from")?;
        check_output_buffer(self.source.format(), buf)?;

        let step = frames_per_unit(self.source.format());
        let remaining = self.source.frames() - self.position;
        let mut count = max_frames.min(buf.capacity()).min(remaining);
        if step > 1 && count < remaining {
            count -= count % step;
        }

        if count == 0 {
            buf.clear();
            if remaining == 0 {
                self.state = DecoderState::AtEnd;
            }
            return Ok(0);
        }

        // A trailing partial DSD byte is served whole.
        let copy = count.div_ceil(step) * step;
        buf.copy_frames_from(&self.source, self.position, 0, copy)?;
        buf.set_frames(count);

        self.position += count;
        self.state = DecoderState::Decoding;
        Ok(count)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        ensure_open(self.state, "seek")?;
        let length = self.source.frames() as u64;
        if frame > length {
            return Err(SeekError::OutOfRange {
                frame,
                length: Some(length),
            }
            .into());
        }
        let step = frames_per_unit(self.source.format()) as u64;
        if frame % step != 0 && frame != length {
            return Err(SeekError::Failed(format!(
                "DSD position {} is not byte aligned",
                frame
            ))
            .into());
        }

        self.position = frame as usize;
        self.state = DecoderState::Open;
        Ok(())
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn frame_position(&self) -> u64 {
        self.position as u64
    }

    fn frame_length(&self) -> Option<u64> {
        Some(self.source.frames() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleData;
    use crate::format::SampleFormat;

    fn ramp(frames: usize) -> SampleBuffer {
        let format = AudioFormat::pcm(44_100.0, 1, SampleFormat::S16, true);
        SampleBuffer::from_data(format, SampleData::S16((0..frames as i16).collect())).unwrap()
    }

    #[test]
    fn test_decode_before_open_is_invalid() {
        let mut decoder = BufferDecoder::new(ramp(4));
        let mut out = SampleBuffer::new(AudioFormat::pcm(44_100.0, 1, SampleFormat::S16, true), 4);
        let err = decoder.decode(&mut out, 4).unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidState(_)));
    }

    #[test]
    fn test_decode_until_end() {
        let mut decoder = BufferDecoder::new(ramp(10));
        decoder.open().unwrap();
        let mut out = SampleBuffer::new(AudioFormat::pcm(44_100.0, 1, SampleFormat::S16, true), 4);

        assert_eq!(decoder.decode(&mut out, 8).unwrap(), 4);
        assert_eq!(decoder.decode(&mut out, 8).unwrap(), 4);
        assert_eq!(out.raw_int(0, 0), Some(4));
        assert_eq!(decoder.decode(&mut out, 8).unwrap(), 2);
        assert_eq!(decoder.decode(&mut out, 8).unwrap(), 0);
        assert_eq!(decoder.state(), DecoderState::AtEnd);
    }

    #[test]
    fn test_seek_bounds() {
        let mut decoder = BufferDecoder::new(ramp(10));
        decoder.open().unwrap();

        decoder.seek(10).unwrap();
        assert_eq!(decoder.frame_position(), 10);

        let err = decoder.seek(11).unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Seek(SeekError::OutOfRange { frame: 11, .. })
        ));

        decoder.seek(7).unwrap();
        let mut out = SampleBuffer::new(AudioFormat::pcm(44_100.0, 1, SampleFormat::S16, true), 4);
        assert_eq!(decoder.decode(&mut out, 4).unwrap(), 3);
        assert_eq!(out.raw_int(0, 0), Some(7));
    }

    #[test]
    fn test_rejects_mismatched_buffer() {
        let mut decoder = BufferDecoder::new(ramp(4));
        decoder.open().unwrap();
        let mut out = SampleBuffer::new(AudioFormat::pcm(44_100.0, 2, SampleFormat::S16, true), 4);
        assert!(decoder.decode(&mut out, 4).unwrap_err().is_format_error());
    }
}
