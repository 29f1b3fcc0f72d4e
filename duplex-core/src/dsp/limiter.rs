//! Lookahead peak limiter.
//!
//! Feed-forward design: samples pass through a delay line one lookahead
//! long, while the gain envelope tracks the most restrictive target over
//! everything still inside the line. Gain reduction therefore lands before
//! the offending peak leaves the delay, and release is a one-pole ramp back
//! to unity.

use crate::dsp::db_to_linear;

/// Exponent applied to the reduction target when the soft knee is enabled.
const KNEE_EXPONENT: f32 = 1.5;

#[derive(Debug, Clone)]
pub struct LookaheadLimiter {
    threshold: f32,
    lookahead: usize,
    release_coeff: f32,
    soft_knee: bool,
    /// Circular delay line of input samples.
    delay: Vec<f32>,
    /// Per-slot gain targets, parallel to `delay`.
    targets: Vec<f32>,
    write: usize,
    gain: f32,
}

impl LookaheadLimiter {
    pub fn new(
        threshold_dbfs: f32,
        ceiling_dbfs: f32,
        lookahead_ms: f32,
        release_ms: f32,
        soft_knee: bool,
        sample_rate: u32,
    ) -> Self {
        // The effective threshold never exceeds the ceiling, so the peak
        // bound holds even when the two are configured inconsistently.
        let threshold = db_to_linear(threshold_dbfs).min(db_to_linear(ceiling_dbfs));
        let lookahead = ((sample_rate as f32 * lookahead_ms / 1000.0).round() as usize).max(1);
        let release_samples = (sample_rate as f32 * release_ms / 1000.0).max(1.0);
        Self {
            threshold,
            lookahead,
            release_coeff: (-1.0 / release_samples).exp(),
            soft_knee,
            delay: vec![0.0; lookahead],
            targets: vec![1.0; lookahead],
            write: 0,
            gain: 1.0,
        }
    }

    fn target_for(&self, x: f32) -> f32 {
        let magnitude = x.abs();
        if magnitude <= self.threshold {
            return 1.0;
        }
        let hard = self.threshold / magnitude;
        if self.soft_knee {
            hard.powf(KNEE_EXPONENT)
        } else {
            hard
        }
    }

    /// Process one frame in place. Output lags input by the lookahead.
    pub fn process(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            let x = *sample;
            let incoming_target = self.target_for(x);

            // Most restrictive target across the delay line plus the sample
            // about to enter it.
            let mut window_min = incoming_target;
            for &t in &self.targets {
                if t < window_min {
                    window_min = t;
                }
            }

            if window_min < self.gain {
                // Attack: drop immediately; the reduction still precedes the
                // peak by the full lookahead because the peak is delayed.
                self.gain = window_min;
            } else {
                // Release toward unity, capped by whatever is still in the
                // window.
                let released = 1.0 - (1.0 - self.gain) * self.release_coeff;
                self.gain = released.min(window_min);
            }

            let delayed = self.delay[self.write];
            self.delay[self.write] = x;
            self.targets[self.write] = incoming_target;
            self.write = (self.write + 1) % self.lookahead;

            *sample = delayed * self.gain;
        }
    }
}
