//! # Format Converter
//!
//! Pulls frames from a [`Decoder`] and delivers them in a target PCM format.
//!
//! ## Behavior
//!
//! - **Format-only** (same rate): every input frame yields exactly one output
//!   frame; sample encoding and interleaving change as needed.
//! - **Rate change**: a rubato `FastFixedIn` resampler with cubic
//!   interpolation runs on planar `f64`. Its output delay is trimmed and the
//!   stream is capped at `round(input_frames * ratio)` frames, so lengths stay
//!   sample accurate across the conversion.
//!
//! Channel mapping is never performed: source and target must carry the same
//! channels.

use crate::buffer::SampleBuffer;
use crate::config::ConverterConfig;
use crate::decoder::{check_output_buffer, open_if_needed, Decoder};
use crate::error::{PlaybackError, Result};
use crate::format::AudioFormat;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, instrument};

/// Rate ratios closer to 1.0 than this are treated as equal rates.
const RATIO_EPSILON: f64 = 1e-9;

/// Zero-fed resampler calls allowed after end of stream.
const MAX_FLUSH_ROUNDS: usize = 64;

/// Streaming PCM format and sample-rate converter.
pub struct Converter {
    decoder: Box<dyn Decoder>,
    source: AudioFormat,
    target: AudioFormat,
    input: SampleBuffer,
    ratio: f64,
    resampler: Option<ResampleState>,
    /// Decode failure held back until the frames converted before it are out.
    deferred: Option<PlaybackError>,
}

impl Converter {
    /// Build a converter from `decoder`'s output format to `target`.
    ///
    /// Opens the decoder if it is not open yet.
    #[instrument(skip(decoder, config), fields(target_rate = target.sample_rate))]
    pub fn new(
        mut decoder: Box<dyn Decoder>,
        target: AudioFormat,
        config: &ConverterConfig,
    ) -> Result<Self> {
        config.validate()?;
        open_if_needed(&mut decoder)?;
        let source = decoder.format()?.clone();

        if source.is_dsd() {
            return Err(PlaybackError::Conversion(
                "DSD sources must be decimated or DoP-framed before conversion".to_string(),
            ));
        }
        if !target.is_pcm() {
            return Err(PlaybackError::Conversion(format!(
                "target must be PCM, got {:?}",
                target.sample_format
            )));
        }
        target
            .validate()
            .map_err(|e| PlaybackError::Conversion(e.to_string()))?;
        if source.channels != target.channels {
            return Err(PlaybackError::Conversion(format!(
                "channel count differs: source {} vs target {}",
                source.channels, target.channels
            )));
        }
        if let (Some(from), Some(to)) = (&source.layout, &target.layout) {
            if from != to {
                return Err(PlaybackError::Conversion(format!(
                    "channel layout differs: source {:?} vs target {:?}",
                    from, to
                )));
            }
        }

        let ratio = target.sample_rate / source.sample_rate;
        let resampler = if (ratio - 1.0).abs() > RATIO_EPSILON {
            Some(ResampleState::new(ratio, config, source.channels as usize)?)
        } else {
            None
        };

        debug!(
            source_rate = source.sample_rate,
            source_format = ?source.sample_format,
            target_format = ?target.sample_format,
            ratio,
            resampling = resampler.is_some(),
            "Converter created"
        );

        Ok(Self {
            input: SampleBuffer::new(source.clone(), config.chunk_frames),
            decoder,
            source,
            target,
            ratio,
            resampler,
            deferred: None,
        })
    }

    /// Fill `buf` with up to `frames` target-format frames.
    ///
    /// Returns fewer frames only at end of stream (0 once exhausted) or right
    /// before a decode failure. A decoder error hit after some frames were
    /// produced is held back: this call returns those frames and the next
    /// call returns the error.
    pub fn convert(&mut self, buf: &mut SampleBuffer, frames: usize) -> Result<usize> {
        check_output_buffer(&self.target, buf)?;
        let want = frames.min(buf.capacity());

        let produced = match self.resampler.as_mut() {
            Some(state) => state.convert(
                self.decoder.as_mut(),
                &mut self.input,
                &mut self.deferred,
                buf,
                want,
            ),
            None => self.convert_direct(buf, want)?,
        };

        if produced == 0 {
            if let Some(e) = self.deferred.take() {
                buf.clear();
                return Err(e);
            }
        }
        buf.set_frames(produced);
        Ok(produced)
    }

    /// Take a decode failure held back by the last short `convert`.
    ///
    /// `None` after a short read means the stream really ended.
    pub fn take_deferred_error(&mut self) -> Option<PlaybackError> {
        let draining = self
            .resampler
            .as_ref()
            .is_some_and(|state| state.out_offset < state.out_len);
        if draining {
            return None;
        }
        self.deferred.take()
    }

    fn convert_direct(&mut self, buf: &mut SampleBuffer, want: usize) -> Result<usize> {
        if self.deferred.is_some() {
            return Ok(0);
        }
        let same_encoding = self.source.sample_format == self.target.sample_format;
        let channels = self.target.channels as usize;
        let mut produced = 0;

        while produced < want {
            let request = (want - produced).min(self.input.capacity());
            let n = match self.decoder.decode(&mut self.input, request) {
                Ok(n) => n,
                Err(e) if produced > 0 => {
                    debug!(error = %e, produced, "Holding decode error until converted frames drain");
                    self.deferred = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }

            if same_encoding {
                buf.copy_frames_from(&self.input, 0, produced, n)?;
            } else {
                for frame in 0..n {
                    for channel in 0..channels {
                        buf.set_sample(produced + frame, channel, self.input.sample(frame, channel));
                    }
                }
            }
            produced += n;
        }

        Ok(produced)
    }

    /// Drop resampler history and buffered frames. The decoder stays open
    /// and positioned where it is.
    pub fn reset(&mut self) {
        self.input.clear();
        self.deferred = None;
        if let Some(state) = self.resampler.as_mut() {
            state.reset();
        }
    }

    /// Seek the decoder (in source frames) and reset conversion state.
    pub fn seek(&mut self, frame: u64) -> Result<()> {
        self.decoder.seek(frame)?;
        self.reset();
        Ok(())
    }

    pub fn source_format(&self) -> &AudioFormat {
        &self.source
    }

    pub fn target_format(&self) -> &AudioFormat {
        &self.target
    }

    pub fn decoder(&self) -> &dyn Decoder {
        self.decoder.as_ref()
    }

    pub fn decoder_mut(&mut self) -> &mut dyn Decoder {
        self.decoder.as_mut()
    }

    pub fn into_decoder(self) -> Box<dyn Decoder> {
        self.decoder
    }

    /// Output frames per input frame.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }
}

/// Resampler plus its planar staging buffers.
struct ResampleState {
    resampler: FastFixedIn<f64>,
    ratio: f64,
    in_planes: Vec<Vec<f64>>,
    out_planes: Vec<Vec<f64>>,
    out_offset: usize,
    out_len: usize,
    delay_remaining: usize,
    input_total: u64,
    output_total: u64,
    source_eos: bool,
    flush_rounds: usize,
}

impl ResampleState {
    fn new(ratio: f64, config: &ConverterConfig, channels: usize) -> Result<Self> {
        let resampler = FastFixedIn::<f64>::new(
            ratio,
            config.max_relative_ratio,
            PolynomialDegree::Cubic,
            config.chunk_frames,
            channels,
        )
        .map_err(|e| PlaybackError::Conversion(format!("resampler setup failed: {}", e)))?;

        let in_capacity = resampler.input_frames_max();
        let out_capacity = resampler.output_frames_max();
        let delay = resampler.output_delay();

        Ok(Self {
            resampler,
            ratio,
            in_planes: (0..channels).map(|_| Vec::with_capacity(in_capacity)).collect(),
            out_planes: vec![vec![0.0; out_capacity]; channels],
            out_offset: 0,
            out_len: 0,
            delay_remaining: delay,
            input_total: 0,
            output_total: 0,
            source_eos: false,
            flush_rounds: 0,
        })
    }

    fn reset(&mut self) {
        self.resampler.reset();
        for plane in &mut self.in_planes {
            plane.clear();
        }
        self.out_offset = 0;
        self.out_len = 0;
        self.delay_remaining = self.resampler.output_delay();
        self.input_total = 0;
        self.output_total = 0;
        self.source_eos = false;
        self.flush_rounds = 0;
    }

    /// Total output frames for the input seen so far (final once at EOS).
    fn expected_total(&self) -> u64 {
        (self.input_total as f64 * self.ratio).round() as u64
    }

    fn finished(&self) -> bool {
        self.source_eos
            && (self.output_total >= self.expected_total() || self.flush_rounds > MAX_FLUSH_ROUNDS)
    }

    /// Resample into `buf`. Decoder and resampler failures end the input
    /// and land in `failure`; whatever was staged before them still drains.
    fn convert(
        &mut self,
        decoder: &mut dyn Decoder,
        input: &mut SampleBuffer,
        failure: &mut Option<PlaybackError>,
        buf: &mut SampleBuffer,
        want: usize,
    ) -> usize {
        let channels = self.out_planes.len();
        let mut produced = 0;

        while produced < want {
            if self.out_offset < self.out_len {
                let take = (want - produced).min(self.out_len - self.out_offset);
                for (channel, plane) in self.out_planes.iter().enumerate().take(channels) {
                    for i in 0..take {
                        buf.set_sample(produced + i, channel, plane[self.out_offset + i]);
                    }
                }
                produced += take;
                self.out_offset += take;
                self.output_total += take as u64;
                continue;
            }

            if self.finished() {
                break;
            }
            if let Err(e) = self.refill(decoder, input, failure) {
                failure.get_or_insert(e);
                self.source_eos = true;
                self.flush_rounds = MAX_FLUSH_ROUNDS + 1;
                break;
            }
        }

        produced
    }

    /// Run the resampler once, pulling input from the decoder as needed.
    fn refill(
        &mut self,
        decoder: &mut dyn Decoder,
        input: &mut SampleBuffer,
        failure: &mut Option<PlaybackError>,
    ) -> Result<()> {
        let need = self.resampler.input_frames_next();
        let mut staged = self.in_planes.first().map_or(0, Vec::len);

        while !self.source_eos && staged < need {
            let request = (need - staged).min(input.capacity());
            let n = match decoder.decode(input, request) {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, staged, "Decode failed, flushing staged input");
                    *failure = Some(e);
                    self.source_eos = true;
                    break;
                }
            };
            if n == 0 {
                self.source_eos = true;
                break;
            }
            for (channel, plane) in self.in_planes.iter_mut().enumerate() {
                plane.extend((0..n).map(|frame| input.sample(frame, channel)));
            }
            staged += n;
            self.input_total += n as u64;
        }

        let result = if staged >= need {
            self.resampler
                .process_into_buffer(&self.in_planes, &mut self.out_planes, None)
        } else if staged > 0 {
            self.resampler
                .process_partial_into_buffer(Some(self.in_planes.as_slice()), &mut self.out_planes, None)
        } else {
            self.flush_rounds += 1;
            self.resampler.process_partial_into_buffer(
                None::<&[Vec<f64>]>,
                &mut self.out_planes,
                None,
            )
        };
        let (_, produced) =
            result.map_err(|e| PlaybackError::Internal(format!("resampler failed: {}", e)))?;

        for plane in &mut self.in_planes {
            plane.clear();
        }

        let skip = self.delay_remaining.min(produced);
        self.delay_remaining -= skip;
        let mut end = produced;
        if self.source_eos {
            let room = self.expected_total().saturating_sub(self.output_total) as usize;
            end = end.min(skip + room);
        }

        self.out_offset = skip;
        self.out_len = end.max(skip);
        Ok(())
    }
}
