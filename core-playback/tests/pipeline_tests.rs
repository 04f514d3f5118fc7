//! Integration tests for the decode/convert/buffer pipeline
//!
//! This test suite verifies:
//! - Ring buffer accounting and ordering under mixed chunk sizes
//! - DoP framing of DSD streams (markers, byte order, odd-length padding)
//! - Seamless looping of a region across decode calls
//! - Frame-exact conversion when only the sample encoding changes
//! - Error reporting from byte sources through the symphonia decoder

use bridge_traits::error::BridgeError;
use bridge_traits::io::ByteSource;
use core_playback::decoder::dop::{unpack, DOP_MARKER_EVEN, DOP_MARKER_ODD};
use core_playback::{
    AudioFormat, BufferDecoder, Converter, ConverterConfig, Decoder, DecoderState, DopDecoder,
    FrameRange, LoopMode, LoopableRegionDecoder, RingBuffer, SampleBuffer, SampleData,
    SampleFormat,
};
use mockall::mock;
use std::io::SeekFrom;

// ============================================================================
// Helpers
// ============================================================================

fn stereo_s16() -> AudioFormat {
    AudioFormat::pcm(44_100.0, 2, SampleFormat::S16, true)
}

/// Stereo ramp: left = frame index, right = -frame index.
fn stereo_ramp(frames: usize) -> SampleBuffer {
    let data = (0..frames)
        .flat_map(|i| [i as i16, -(i as i16)])
        .collect::<Vec<_>>();
    SampleBuffer::from_data(stereo_s16(), SampleData::S16(data)).unwrap()
}

fn mono_ramp(frames: usize) -> BufferDecoder {
    let format = AudioFormat::pcm(48_000.0, 1, SampleFormat::S32, true);
    let data = (0..frames as i32).collect();
    BufferDecoder::new(SampleBuffer::from_data(format, SampleData::S32(data)).unwrap())
}

fn drain_channel(decoder: &mut impl Decoder, chunk: usize, channel: usize) -> Vec<i32> {
    let mut out = SampleBuffer::new(decoder.format().unwrap().clone(), chunk);
    let mut samples = Vec::new();
    loop {
        let n = decoder.decode(&mut out, chunk).unwrap();
        if n == 0 {
            return samples;
        }
        samples.extend((0..n).map(|i| out.raw_int(i, channel).unwrap()));
    }
}

// ============================================================================
// Ring Buffer
// ============================================================================

#[test]
fn test_ring_preserves_order_across_wraparound() {
    let (mut producer, mut consumer) = RingBuffer::new(stereo_s16(), 100).unwrap().split();
    let source = stereo_ramp(1000);
    let mut staged = SampleBuffer::new(stereo_s16(), 64);
    let mut out = SampleBuffer::new(stereo_s16(), 64);
    let mut written = 0;
    let mut received = Vec::new();

    let write_sizes = [7, 33, 64, 1, 50];
    let read_sizes = [13, 64, 2, 40];
    let mut step = 0;
    while received.len() < 1000 {
        let want = write_sizes[step % write_sizes.len()].min(1000 - written);
        staged.clear();
        staged.copy_frames_from(&source, written, 0, want).unwrap();
        staged.set_frames(want);

        let free_before = producer.available_to_write();
        let w = producer.write(&staged, want);
        assert!(w <= free_before);
        written += w;
        assert_eq!(
            producer.available_to_read() + producer.available_to_write(),
            producer.capacity()
        );

        let available_before = consumer.available_to_read();
        let r = consumer.read(&mut out, read_sizes[step % read_sizes.len()]);
        assert!(r <= available_before);
        assert_eq!(out.frames(), r);
        for i in 0..r {
            received.push((out.raw_int(i, 0).unwrap(), out.raw_int(i, 1).unwrap()));
        }
        assert_eq!(
            consumer.available_to_read() + consumer.available_to_write(),
            consumer.capacity()
        );
        step += 1;
    }

    let expected: Vec<(i32, i32)> = (0..1000).map(|i| (i, -i)).collect();
    assert_eq!(received, expected);
    assert!(consumer.is_empty());
    assert!(producer.is_empty());
}

#[test]
fn test_ring_never_overwrites_unread_frames() {
    let (mut producer, mut consumer) = RingBuffer::new(stereo_s16(), 16).unwrap().split();
    let source = stereo_ramp(40);

    assert_eq!(producer.write(&source, 40), 16);
    assert!(producer.is_full());
    assert_eq!(producer.write(&source, 40), 0);

    let mut out = SampleBuffer::new(stereo_s16(), 16);
    assert_eq!(consumer.read(&mut out, 16), 16);
    assert_eq!(out.raw_int(15, 0), Some(15));
    assert_eq!(consumer.read(&mut out, 16), 0);
}

// ============================================================================
// DoP Framing
// ============================================================================

#[test]
fn test_dop_round_trip_restores_dsd_bytes() {
    let bytes: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(37)).collect();
    let format = AudioFormat::dsd(2_822_400.0, 2);
    let source = SampleBuffer::from_data(format, SampleData::Dsd(bytes.clone())).unwrap();
    let mut decoder = DopDecoder::new(BufferDecoder::new(source));
    decoder.open().unwrap();
    assert_eq!(decoder.frame_length(), Some(16));

    let mut out = SampleBuffer::new(decoder.format().unwrap().clone(), 5);
    let mut restored = vec![Vec::new(), Vec::new()];
    let mut frame = 0u64;
    loop {
        let n = decoder.decode(&mut out, 5).unwrap();
        if n == 0 {
            break;
        }
        for i in 0..n {
            for (channel, stream) in restored.iter_mut().enumerate() {
                let (marker, older, newer) = unpack(out.raw_int(i, channel).unwrap()).unwrap();
                let expected = if frame % 2 == 0 { DOP_MARKER_EVEN } else { DOP_MARKER_ODD };
                assert_eq!(marker, expected);
                stream.extend([older, newer]);
            }
            frame += 1;
        }
    }

    assert_eq!(frame, 16);
    let left: Vec<u8> = bytes.iter().step_by(2).copied().collect();
    let right: Vec<u8> = bytes.iter().skip(1).step_by(2).copied().collect();
    assert_eq!(restored[0], left);
    assert_eq!(restored[1], right);
}

#[test]
fn test_dop_pads_odd_trailing_byte() {
    let format = AudioFormat::dsd(2_822_400.0, 1);
    let source =
        SampleBuffer::from_data(format, SampleData::Dsd(vec![0x11, 0x22, 0x33, 0x44, 0x55]))
            .unwrap();
    let mut decoder = DopDecoder::new(BufferDecoder::new(source));
    decoder.open().unwrap();
    assert_eq!(decoder.frame_length(), Some(3));

    let frames: Vec<_> = drain_channel(&mut decoder, 8, 0)
        .into_iter()
        .map(|s| unpack(s).unwrap())
        .collect();
    assert_eq!(
        frames,
        vec![
            (DOP_MARKER_EVEN, 0x11, 0x22),
            (DOP_MARKER_ODD, 0x33, 0x44),
            (DOP_MARKER_EVEN, 0x55, 0x00),
        ]
    );
    assert_eq!(decoder.state(), DecoderState::AtEnd);
}

// ============================================================================
// Looping
// ============================================================================

#[test]
fn test_region_repeats_without_gap() {
    let region = FrameRange::new(100, 200);
    let mut decoder = LoopableRegionDecoder::new(mono_ramp(1000), region, LoopMode::Repeat(1));
    decoder.open().unwrap();
    assert_eq!(decoder.frame_length(), Some(400));

    // Odd chunk size so the wrap lands inside a decode call.
    let samples = drain_channel(&mut decoder, 37, 0);
    let once: Vec<i32> = (100..300).collect();
    let expected: Vec<i32> = once.iter().chain(once.iter()).copied().collect();
    assert_eq!(samples, expected);
}

#[test]
fn test_forever_loop_keeps_producing() {
    let mut decoder =
        LoopableRegionDecoder::new(mono_ramp(50), FrameRange::new(10, 5), LoopMode::Forever);
    decoder.open().unwrap();

    let mut out = SampleBuffer::new(decoder.format().unwrap().clone(), 64);
    for _ in 0..10 {
        assert_eq!(decoder.decode(&mut out, 64).unwrap(), 64);
    }
    assert!(decoder.completed_passes() >= 127);
}

// ============================================================================
// Conversion
// ============================================================================

#[test]
fn test_format_only_conversion_preserves_frame_count() {
    let target = AudioFormat::pcm(44_100.0, 2, SampleFormat::F32, false);
    let config = ConverterConfig::default();

    for frames in [0, 1, 2, 511, 1023, 1024, 1025, 4097, 44_100, 99_999, 100_000] {
        let decoder = BufferDecoder::new(stereo_ramp(frames));
        let mut converter = Converter::new(Box::new(decoder), target.clone(), &config).unwrap();
        assert!(!converter.is_resampling());

        let mut out = SampleBuffer::new(target.clone(), 4096);
        let mut total = 0;
        loop {
            let n = converter.convert(&mut out, 4096).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, frames, "frame count changed for {} input frames", frames);
    }
}

#[test]
fn test_conversion_changes_encoding_only() {
    let target = AudioFormat::pcm(44_100.0, 2, SampleFormat::F64, true);
    let decoder = BufferDecoder::new(stereo_ramp(4));
    let mut converter =
        Converter::new(Box::new(decoder), target.clone(), &ConverterConfig::default()).unwrap();

    let mut out = SampleBuffer::new(target, 8);
    assert_eq!(converter.convert(&mut out, 8).unwrap(), 4);
    assert_eq!(out.sample(3, 0), 3.0 / 32768.0);
    assert_eq!(out.sample(3, 1), -3.0 / 32768.0);
}

// ============================================================================
// Byte Source Errors
// ============================================================================

mock! {
    Source {}

    impl ByteSource for Source {
        fn read(&mut self, buf: &mut [u8]) -> bridge_traits::error::Result<usize>;
        fn seek(&mut self, pos: SeekFrom) -> bridge_traits::error::Result<u64>;
        fn length(&self) -> Option<u64>;
        fn is_seekable(&self) -> bool;
    }
}

#[test]
fn test_unreadable_source_fails_open() {
    let mut source = MockSource::new();
    source
        .expect_read()
        .returning(|_| Err(BridgeError::OperationFailed("device removed".to_string())));
    source.expect_seek().returning(|_| Ok(0));
    source.expect_length().return_const(Some(1024u64));
    source.expect_is_seekable().return_const(true);

    let mut decoder = core_playback::SymphoniaDecoder::new(Box::new(source));
    let err = decoder.open().unwrap_err();
    assert!(err.is_io_error() || err.is_format_error(), "unexpected error: {}", err);
    assert!(!decoder.is_open());
}

#[test]
fn test_garbage_bytes_are_a_format_error() {
    let mut remaining = 4096usize;
    let mut source = MockSource::new();
    source.expect_read().returning(move |buf| {
        let n = buf.len().min(remaining);
        buf[..n].fill(0xA5);
        remaining -= n;
        Ok(n)
    });
    source.expect_seek().returning(|_| Ok(0));
    source.expect_length().return_const(Some(4096u64));
    source.expect_is_seekable().return_const(false);

    let mut decoder = core_playback::SymphoniaDecoder::new(Box::new(source));
    assert!(decoder.open().unwrap_err().is_format_error());
}
