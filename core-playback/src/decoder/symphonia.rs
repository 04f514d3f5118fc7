//! # Symphonia Decoder Implementation
//!
//! Compressed and container decoding through the Symphonia library.

use super::{check_output_buffer, ensure_open, Decoder, DecoderState};
use crate::buffer::{SampleBuffer, SampleData};
use crate::error::{PlaybackError, Result, SeekError};
use crate::format::{AudioFormat, ChannelLayout, SampleFormat};
use bridge_traits::{BridgeError, ByteSource, FileSource};
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, error, info, instrument, warn};

/// Corrupt packets tolerated in a row before decoding fails.
const MAX_CONSECUTIVE_ERRORS: usize = 10;

/// Presents a [`ByteSource`] as a Symphonia [`MediaSource`].
///
/// `MediaSource` must be `Sync`; the mutex is only ever accessed through
/// `get_mut`, so it never actually locks.
struct ByteSourceAdapter {
    source: Mutex<Box<dyn ByteSource>>,
    seekable: bool,
    length: Option<u64>,
}

impl ByteSourceAdapter {
    fn new(source: Box<dyn ByteSource>) -> Self {
        Self {
            seekable: source.is_seekable(),
            length: source.length(),
            source: Mutex::new(source),
        }
    }
}

fn bridge_to_io(error: BridgeError) -> io::Error {
    match error {
        BridgeError::Io(e) => e,
        BridgeError::NotSeekable => io::Error::new(io::ErrorKind::Unsupported, error),
        other => io::Error::other(other),
    }
}

impl io::Read for ByteSourceAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.get_mut().read(buf).map_err(bridge_to_io)
    }
}

impl io::Seek for ByteSourceAdapter {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.source.get_mut().seek(pos).map_err(bridge_to_io)
    }
}

impl MediaSource for ByteSourceAdapter {
    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn byte_len(&self) -> Option<u64> {
        self.length
    }
}

/// Decoder for every container and codec enabled through the `decoder-*`
/// features.
///
/// Output is planar PCM in the stream's native sample format: 8- and 16-bit
/// sources become `S16`, 24-bit become `S24`, 32-bit integer become `S32`,
/// and float sources keep their width.
///
/// ## State Management
///
/// The byte source is consumed by `open`. The first packet is decoded during
/// `open` because some codecs (AAC in MP4 in particular) only report their
/// channel count once audio has been decoded.
pub struct SymphoniaDecoder {
    source: Option<Box<dyn ByteSource>>,
    extension: Option<String>,
    state: DecoderState,

    reader: Option<Box<dyn FormatReader>>,
    codec: Option<Box<dyn CodecDecoder>>,
    track_id: u32,
    format: Option<AudioFormat>,
    length: Option<u64>,
    seekable: bool,

    /// Decoded frames not yet handed out (planar, output format).
    pending: Option<SampleBuffer>,
    /// Frames to drop after an accurate seek lands early.
    skip: u64,
    position: u64,
    eof: bool,
    /// Packet failure held back until the frames decoded before it are out.
    deferred: Option<PlaybackError>,
}

impl SymphoniaDecoder {
    /// Create a decoder over a byte source. Nothing is read until `open`.
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        Self {
            source: Some(source),
            extension: None,
            state: DecoderState::Unopened,
            reader: None,
            codec: None,
            track_id: 0,
            format: None,
            length: None,
            seekable: false,
            pending: None,
            skip: 0,
            position: 0,
            eof: false,
            deferred: None,
        }
    }

    /// Open a local file, using its extension as the probe hint.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = FileSource::open(path)?;
        let decoder = Self::new(Box::new(source));
        Ok(match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => decoder.with_extension_hint(ext),
            None => decoder,
        })
    }

    /// File extension used to speed up container probing.
    pub fn with_extension_hint(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into().to_lowercase());
        self
    }

    /// Read the next packet of the selected track into `pending`.
    ///
    /// Returns `Ok(false)` at end of stream. Corrupt packets are skipped up to
    /// [`MAX_CONSECUTIVE_ERRORS`] in a row.
    #[instrument(skip(self), level = "trace")]
    fn fill_pending(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PlaybackError::InvalidState("decoder is not open".to_string()))?;
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| PlaybackError::InvalidState("decoder is not open".to_string()))?;

        let mut consecutive_errors = 0;
        loop {
            let packet = match reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(position = self.position, "Reached end of stream");
                    self.eof = true;
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!("Track list changed mid-stream");
                    return Err(PlaybackError::Decode(
                        "track list changed, reset required".to_string(),
                    ));
                }
                Err(SymphoniaError::IoError(e)) => {
                    consecutive_errors += 1;
                    warn!(
                        "I/O error reading packet (attempt {}/{}): {}",
                        consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("Too many consecutive I/O errors, giving up");
                        return Err(PlaybackError::Io(e));
                    }
                    continue;
                }
                Err(e) => {
                    error!("Fatal format reader error: {}", e);
                    return Err(PlaybackError::Decode(format!("failed to read packet: {}", e)));
                }
            };

            while !reader.metadata().is_latest() {
                reader.metadata().pop();
            }

            if packet.track_id() != self.track_id {
                continue;
            }

            match codec.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    store_decoded(&decoded, &mut self.pending, &mut self.format)?;
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    consecutive_errors += 1;
                    warn!(
                        "Skipping packet with decode error (attempt {}/{}): {}",
                        consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("Too many consecutive decode errors, stream may be corrupted");
                        return Err(PlaybackError::Decode(format!(
                            "decoder failure after {} failed packets: {}",
                            MAX_CONSECUTIVE_ERRORS, e
                        )));
                    }
                    continue;
                }
                Err(e) => {
                    error!("Fatal decode error: {}", e);
                    return Err(PlaybackError::Decode(format!("failed to decode packet: {}", e)));
                }
            }
        }
    }
}

impl Decoder for SymphoniaDecoder {
    #[instrument(skip(self), fields(hint = ?self.extension))]
    fn open(&mut self) -> Result<()> {
        let source = self.source.take().ok_or_else(|| {
            PlaybackError::InvalidState("byte source already consumed".to_string())
        })?;

        let adapter = ByteSourceAdapter::new(source);
        self.seekable = adapter.seekable;
        let stream = MediaSourceStream::new(Box::new(adapter), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = &self.extension {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                stream,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                error!("Format probe failed: {}", e);
                open_error(e, "failed to probe format")
            })?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlaybackError::Format("no decodable audio track".to_string()))?;

        self.track_id = track.id;
        self.length = track.codec_params.n_frames;
        let layout_hint = track
            .codec_params
            .channels
            .map(|channels| ChannelLayout::Bitmap(channels.bits()));

        let codec = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                error!("Failed to create codec decoder: {}", e);
                open_error(e, "unsupported codec")
            })?;

        self.reader = Some(reader);
        self.codec = Some(codec);
        self.position = 0;
        self.skip = 0;
        self.eof = false;

        if !self.fill_pending()? {
            return Err(PlaybackError::Format(
                "stream contains no audio frames".to_string(),
            ));
        }

        let format = self
            .format
            .as_mut()
            .ok_or_else(|| PlaybackError::Internal("format unknown after first packet".to_string()))?;
        if let Some(layout) = layout_hint {
            if layout.channel_count() == format.channels {
                format.layout = Some(layout);
            }
        }

        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            sample_format = ?format.sample_format,
            length = ?self.length,
            "Symphonia decoder opened"
        );

        self.state = DecoderState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == DecoderState::Closed {
            return Ok(());
        }
        self.reader = None;
        self.codec = None;
        self.pending = None;
        self.deferred = None;
        self.source = None;
        self.state = DecoderState::Closed;
        debug!("Symphonia decoder closed");
        Ok(())
    }

    fn state(&self) -> DecoderState {
        self.state
    }

    fn format(&self) -> Result<&AudioFormat> {
        ensure_open(self.state, "query the format of")?;
        self.format
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

        let target = max_frames.min(buf.capacity());
        let mut produced = 0;

        while produced < target {
            let available = self.pending.as_ref().map_or(0, |p| p.frames());
            if available == 0 {
                match self.fill_pending() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) if produced > 0 => {
                        self.deferred = Some(e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(pending) = self.pending.as_mut() else {
                break;
            };

            if self.skip > 0 {
                let dropped = (self.skip as usize).min(available);
                pending.discard_front(dropped);
                self.skip -= dropped as u64;
                continue;
            }

            let count = (target - produced).min(available);
            buf.copy_frames_from(pending, 0, produced, count)?;
            pending.discard_front(count);
            produced += count;
        }

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
        if !self.seekable {
            return Err(SeekError::Unsupported.into());
        }
        if let Some(length) = self.length {
            if frame > length {
                return Err(SeekError::OutOfRange {
                    frame,
                    length: Some(length),
                }
                .into());
            }
            if frame == length {
                if let Some(pending) = self.pending.as_mut() {
                    pending.clear();
                }
                self.deferred = None;
                self.eof = true;
                self.position = frame;
                self.state = DecoderState::Open;
                return Ok(());
            }
        }

        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PlaybackError::InvalidState("decoder is not open".to_string()))?;
        let seeked = reader
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| {
                warn!("Seek to frame {} failed: {}", frame, e);
                match e {
                    SymphoniaError::Unsupported(_) => SeekError::Unsupported,
                    SymphoniaError::SeekError(_) => SeekError::OutOfRange {
                        frame,
                        length: self.length,
                    },
                    other => SeekError::Failed(other.to_string()),
                }
            })?;

        if let Some(codec) = self.codec.as_mut() {
            codec.reset();
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.clear();
        }

        self.deferred = None;
        self.skip = frame.saturating_sub(seeked.actual_ts);
        self.position = frame;
        self.eof = false;
        self.state = DecoderState::Open;
        debug!(actual = seeked.actual_ts, skip = self.skip, "Seek completed");
        Ok(())
    }

    fn supports_seeking(&self) -> bool {
        match self.state {
            DecoderState::Unopened => self.source.as_ref().is_some_and(|s| s.is_seekable()),
            _ => self.seekable,
        }
    }

    fn frame_position(&self) -> u64 {
        self.position
    }

    fn frame_length(&self) -> Option<u64> {
        self.length
    }
}

fn open_error(error: SymphoniaError, context: &str) -> PlaybackError {
    match error {
        SymphoniaError::IoError(e) if e.kind() != io::ErrorKind::UnexpectedEof => {
            PlaybackError::Io(e)
        }
        other => PlaybackError::Format(format!("{}: {}", context, other)),
    }
}

/// Output encoding for a decoded Symphonia buffer.
fn native_sample_format(decoded: &AudioBufferRef<'_>) -> SampleFormat {
    match decoded {
        AudioBufferRef::U8(_) | AudioBufferRef::S8(_) => SampleFormat::S16,
        AudioBufferRef::U16(_) | AudioBufferRef::S16(_) => SampleFormat::S16,
        AudioBufferRef::U24(_) | AudioBufferRef::S24(_) => SampleFormat::S24,
        AudioBufferRef::U32(_) | AudioBufferRef::S32(_) => SampleFormat::S32,
        AudioBufferRef::F32(_) => SampleFormat::F32,
        AudioBufferRef::F64(_) => SampleFormat::F64,
    }
}

/// Copy one decoded packet into the pending buffer, allocating it on the
/// first packet (and growing it if a later packet is larger).
fn store_decoded(
    decoded: &AudioBufferRef<'_>,
    pending: &mut Option<SampleBuffer>,
    format: &mut Option<AudioFormat>,
) -> Result<()> {
    let spec = decoded.spec();
    let channels = spec.channels.count() as u16;
    let frames = decoded.frames();

    let output = match format {
        Some(existing) => {
            if existing.channels != channels {
                return Err(PlaybackError::Decode(format!(
                    "channel count changed mid-stream from {} to {}",
                    existing.channels, channels
                )));
            }
            existing.clone()
        }
        None => {
            let detected = AudioFormat::pcm(
                spec.rate as f64,
                channels,
                native_sample_format(decoded),
                false,
            );
            *format = Some(detected.clone());
            detected
        }
    };

    let needs_alloc = pending
        .as_ref()
        .map_or(true, |buffer| buffer.capacity() < frames);
    if needs_alloc {
        *pending = Some(SampleBuffer::new(output.clone(), decoded.capacity().max(frames)));
    }
    let Some(target) = pending.as_mut() else {
        return Err(PlaybackError::Internal("pending buffer missing".to_string()));
    };

    let stride = target.stride();
    let is_s24 = output.sample_format == SampleFormat::S24;
    match (decoded, target.data_mut()) {
        (AudioBufferRef::U8(b), SampleData::S16(d)) => copy_planes(&**b, d, stride, i16::from_sample),
        (AudioBufferRef::S8(b), SampleData::S16(d)) => copy_planes(&**b, d, stride, i16::from_sample),
        (AudioBufferRef::U16(b), SampleData::S16(d)) => copy_planes(&**b, d, stride, i16::from_sample),
        (AudioBufferRef::S16(b), SampleData::S16(d)) => copy_planes(&**b, d, stride, |s| s),
        (AudioBufferRef::U24(b), SampleData::S32(d)) if is_s24 => {
            copy_planes(&**b, d, stride, |s| i32::from_sample(s) >> 8)
        }
        (AudioBufferRef::S24(b), SampleData::S32(d)) if is_s24 => {
            copy_planes(&**b, d, stride, |s| i32::from_sample(s) >> 8)
        }
        (AudioBufferRef::U32(b), SampleData::S32(d)) => copy_planes(&**b, d, stride, i32::from_sample),
        (AudioBufferRef::S32(b), SampleData::S32(d)) => copy_planes(&**b, d, stride, |s| s),
        (AudioBufferRef::F32(b), SampleData::F32(d)) => copy_planes(&**b, d, stride, |s| s),
        (AudioBufferRef::F64(b), SampleData::F64(d)) => copy_planes(&**b, d, stride, |s| s),
        _ => {
            return Err(PlaybackError::Decode(
                "sample format changed mid-stream".to_string(),
            ))
        }
    }
    target.set_frames(frames);
    Ok(())
}

fn copy_planes<S: Sample, T>(src: &AudioBuffer<S>, dst: &mut [T], stride: usize, convert: impl Fn(S) -> T) {
    for channel in 0..src.spec().channels.count() {
        let base = channel * stride;
        for (i, sample) in src.chan(channel).iter().enumerate() {
            dst[base + i] = convert(*sample);
        }
    }
}

#[cfg(all(test, feature = "decoder-wav"))]
mod tests {
    use super::*;
    use bridge_traits::MemorySource;

    /// Minimal 16-bit PCM WAV file.
    fn wav_bytes(channels: u16, rate: u32, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    /// Serves the first `limit` bytes, then fails every read.
    struct TruncatedSource {
        inner: MemorySource,
        position: u64,
        limit: u64,
    }

    impl ByteSource for TruncatedSource {
        fn read(&mut self, buf: &mut [u8]) -> bridge_traits::error::Result<usize> {
            let left = self.limit.saturating_sub(self.position) as usize;
            if left == 0 {
                return Err(BridgeError::OperationFailed("connection reset".to_string()));
            }
            let len = buf.len().min(left);
            let n = self.inner.read(&mut buf[..len])?;
            self.position += n as u64;
            Ok(n)
        }

        fn seek(&mut self, pos: io::SeekFrom) -> bridge_traits::error::Result<u64> {
            self.position = self.inner.seek(pos)?;
            Ok(self.position)
        }

        fn length(&self) -> Option<u64> {
            self.inner.length()
        }
    }

    fn open_ramp(frames: usize) -> SymphoniaDecoder {
        let samples: Vec<i16> = (0..frames).flat_map(|i| [i as i16, -(i as i16)]).collect();
        let source = MemorySource::new(wav_bytes(2, 44_100, &samples));
        let mut decoder = SymphoniaDecoder::new(Box::new(source)).with_extension_hint("wav");
        decoder.open().unwrap();
        decoder
    }

    #[test]
    fn test_open_reports_native_planar_format() {
        let decoder = open_ramp(1000);
        let format = decoder.format().unwrap();
        assert_eq!(format.sample_rate, 44_100.0);
        assert_eq!(format.channels, 2);
        assert_eq!(format.sample_format, SampleFormat::S16);
        assert!(!format.interleaved);
        assert_eq!(decoder.frame_length(), Some(1000));
    }

    #[test]
    fn test_decodes_every_frame() {
        let mut decoder = open_ramp(1000);
        let format = decoder.format().unwrap().clone();
        let mut out = SampleBuffer::new(format, 300);

        let mut total = 0;
        loop {
            let n = decoder.decode(&mut out, 300).unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(out.raw_int(0, 0), Some(total as i32));
            assert_eq!(out.raw_int(0, 1), Some(-(total as i32)));
            total += n;
        }
        assert_eq!(total, 1000);
        assert_eq!(decoder.state(), DecoderState::AtEnd);
    }

    #[test]
    fn test_seek_lands_on_exact_frame() {
        let mut decoder = open_ramp(1000);
        decoder.seek(777).unwrap();

        let format = decoder.format().unwrap().clone();
        let mut out = SampleBuffer::new(format, 16);
        assert_eq!(decoder.decode(&mut out, 16).unwrap(), 16);
        assert_eq!(out.raw_int(0, 0), Some(777));

        decoder.seek(1000).unwrap();
        assert_eq!(decoder.decode(&mut out, 16).unwrap(), 0);

        let err = decoder.seek(1001).unwrap_err();
        assert!(err.is_seek_error());
    }

    #[test]
    fn test_garbage_is_format_error() {
        let source = MemorySource::new(vec![0x42u8; 256]);
        let mut decoder = SymphoniaDecoder::new(Box::new(source));
        assert!(decoder.open().unwrap_err().is_format_error());
    }

    #[test]
    fn test_read_error_follows_decoded_frames() {
        let samples: Vec<i16> = (0..20_000).flat_map(|i| [i as i16, -(i as i16)]).collect();
        let source = TruncatedSource {
            inner: MemorySource::new(wav_bytes(2, 44_100, &samples)),
            position: 0,
            limit: 48 * 1024,
        };
        let mut decoder = SymphoniaDecoder::new(Box::new(source)).with_extension_hint("wav");
        decoder.open().unwrap();

        let format = decoder.format().unwrap().clone();
        let mut out = SampleBuffer::new(format, 20_000);
        let n = decoder.decode(&mut out, 20_000).unwrap();
        assert!(n > 0 && n < 20_000);
        assert_eq!(out.raw_int(n - 1, 0), Some(n as i32 - 1));

        let err = decoder.decode(&mut out, 20_000).unwrap_err();
        assert!(err.is_io_error());
        assert_eq!(out.frames(), 0);
    }
}
