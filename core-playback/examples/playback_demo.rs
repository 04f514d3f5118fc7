//! # Playback Pipeline Example
//!
//! Builds a synthetic DSD tone, decimates it to PCM, loops a region of it
//! and plays the result through a `PlayerNode`, with a thread standing in
//! for the audio device callback.
//!
//! Run with: `cargo run --example playback_demo --package core-playback`

use bridge_traits::time::LogLevel;
use core_playback::{
    AudioFormat, BufferDecoder, DsdPcmDecoder, FrameRange, LoopMode, LoopableRegionDecoder, PlayerConfig,
    PlayerEvent, PlayerNode, Result, SampleBuffer, SampleData, SampleFormat, TransportState,
};
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const DSD_RATE: f64 = 2_822_400.0;
const OUTPUT_RATE: f64 = 48_000.0;
const DEVICE_BLOCK: usize = 512;

/// One second of a 1 kHz tone as first-order sigma-delta DSD, stereo.
fn dsd_tone() -> Result<SampleBuffer> {
    let bytes_per_channel = DSD_RATE as usize / 8;
    let mut data = Vec::with_capacity(bytes_per_channel * 2);
    let mut integrator = 0.0f64;
    let mut bit_index = 0usize;

    for _ in 0..bytes_per_channel {
        let mut byte = 0u8;
        for bit in 0..8 {
            let t = (bit_index + bit) as f64 / DSD_RATE;
            let target = 0.5 * (2.0 * std::f64::consts::PI * 1000.0 * t).sin();
            let out = if integrator >= 0.0 { 1.0 } else { -1.0 };
            integrator += target - out;
            if out > 0.0 {
                byte |= 0x80 >> bit;
            }
        }
        bit_index += 8;
        data.extend([byte, byte]);
    }

    SampleBuffer::from_data(AudioFormat::dsd(DSD_RATE, 2), SampleData::Dsd(data))
}

fn main() -> Result<()> {
    let logging = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug);
    if let Err(e) = init_logging(logging) {
        eprintln!("logging disabled: {}", e);
    }

    // DSD source -> PCM at 352.8 kHz -> 100 ms region played three times.
    let pcm = DsdPcmDecoder::new(BufferDecoder::new(dsd_tone()?));
    let region = FrameRange::new(0, 35_280);
    let looped = LoopableRegionDecoder::new(pcm, region, LoopMode::Repeat(2));

    let target = AudioFormat::pcm(OUTPUT_RATE, 2, SampleFormat::F32, true);
    let observer = |event: PlayerEvent| info!(%event, "Player event");
    let (node, mut renderer) =
        PlayerNode::new(target.clone(), PlayerConfig::low_latency(), Arc::new(observer))?;

    node.play(Box::new(looped))?;
    info!(length = ?node.frame_length(), "Playing");

    let running = Arc::new(AtomicBool::new(true));
    let device = {
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("fake-device".to_string())
            .spawn(move || {
                let mut block = SampleBuffer::new(target, DEVICE_BLOCK);
                let period = Duration::from_secs_f64(DEVICE_BLOCK as f64 / OUTPUT_RATE);
                let mut peak = 0.0f64;
                while running.load(Ordering::Acquire) {
                    let got = renderer.render(&mut block, DEVICE_BLOCK);
                    for frame in 0..got {
                        peak = peak.max(block.sample(frame, 0).abs());
                    }
                    thread::sleep(period);
                }
                peak
            })?
    };

    while node.state() != TransportState::Stopped {
        thread::sleep(Duration::from_millis(20));
    }
    running.store(false, Ordering::Release);
    let peak = device.join().unwrap_or(0.0);

    info!(
        position = node.frame_position(),
        underruns = node.underrun_count(),
        peak,
        "Playback finished"
    );
    Ok(())
}
