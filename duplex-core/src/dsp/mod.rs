//! Per-channel post-processing.
//!
//! Each emitted frame runs through one [`ChannelChain`] per side, in a fixed
//! order: static gain, optional RMS normalization, optional low-pass,
//! optional lookahead limiting, hard ceiling clamp. All state is owned by
//! the chain; nothing here is shared across sessions.

pub mod biquad;
pub mod dither;
pub mod limiter;
pub mod normalize;

use crate::config::{DspConfig, FilterConfig, LimiterConfig};

use self::biquad::Biquad;
use self::limiter::LookaheadLimiter;
use self::normalize::RmsNormalizer;

/// Fraction of the ceiling above which a sample counts as a clip hit.
const CLIP_CENSUS_FRACTION: f32 = 0.999;

pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// dBFS of a linear magnitude; silence maps to negative infinity.
pub fn linear_to_db(x: f32) -> f32 {
    if x <= 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * x.log10()
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

pub fn rms_dbfs(samples: &[f32]) -> f32 {
    linear_to_db(rms(samples))
}

/// The full post-processing chain for one output channel.
pub struct ChannelChain {
    gain: f32,
    normalizer: Option<RmsNormalizer>,
    low_pass: Option<Biquad>,
    limiter: Option<LookaheadLimiter>,
    ceiling: f32,
    clip_census_level: f32,
}

impl ChannelChain {
    pub fn new(
        gain_db: f32,
        dsp: &DspConfig,
        filter: &FilterConfig,
        limiter: &LimiterConfig,
        sample_rate: u32,
    ) -> Self {
        let ceiling = db_to_linear(limiter.ceiling_dbfs);
        Self {
            gain: db_to_linear(gain_db),
            normalizer: dsp.normalize.then(|| {
                RmsNormalizer::new(
                    dsp.target_rms_dbfs,
                    dsp.max_gain_db,
                    dsp.attack_ms,
                    dsp.release_ms,
                    dsp.frame_ms,
                )
            }),
            low_pass: filter
                .low_pass
                .then(|| Biquad::low_pass(sample_rate, filter.low_pass_hz)),
            limiter: limiter.enabled.then(|| {
                LookaheadLimiter::new(
                    limiter.ceiling_dbfs,
                    limiter.ceiling_dbfs,
                    limiter.lookahead_ms,
                    limiter.release_ms,
                    limiter.soft_knee,
                    sample_rate,
                )
            }),
            ceiling,
            clip_census_level: CLIP_CENSUS_FRACTION * ceiling,
        }
    }

    /// Process one frame in place; returns the number of near-ceiling samples.
    pub fn process(&mut self, frame: &mut [f32]) -> u64 {
        if self.gain != 1.0 {
            for sample in frame.iter_mut() {
                *sample *= self.gain;
            }
        }
        if let Some(ref mut normalizer) = self.normalizer {
            normalizer.process(frame);
        }
        if let Some(ref mut low_pass) = self.low_pass {
            low_pass.process(frame);
        }
        if let Some(ref mut limiter) = self.limiter {
            limiter.process(frame);
        }

        let mut clip_hits = 0;
        for sample in frame.iter_mut() {
            if sample.abs() > self.ceiling {
                *sample = self.ceiling.copysign(*sample);
            }
            if sample.abs() >= self.clip_census_level {
                clip_hits += 1;
            }
        }
        clip_hits
    }
}
