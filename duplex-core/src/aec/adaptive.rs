//! Adaptive echo canceller: normalized LMS with double-talk gating.
//!
//! Used whenever no native processor is available. A transversal filter
//! spanning ~50 ms of reference history models the echo path; the stream
//! delay shifts where that window sits in the far history, so delays up to
//! 200 ms stay reachable with a short filter.
//!
//! Weight adaptation is gated on the ratio `E[e²] / E[x²]`: above 0.5 the
//! near side is dominated by local speech (double talk) and updates freeze;
//! below 0.1 the residual is pure echo and adaptation accelerates.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::aec::{AecKind, EchoCanceller, MAX_STREAM_DELAY_MS};
use crate::config::{AecConfig, SuppressionLevel};
use crate::dsp::biquad::Biquad;

/// Filter taps at 48 kHz (~50 ms, enough to span a typical render-to-capture
/// echo path with no delay hint); scaled linearly for other rates.
const FILTER_TAPS_48K: usize = 2400;
const STEP_SIZE: f32 = 0.25;
const REGULARIZATION: f32 = 1e-8;
const WEIGHT_CLIP: f32 = 2.0;
const GRADIENT_CLIP: f32 = 0.5;
/// E[e²]/E[x²] above which adaptation freezes (double talk).
const FREEZE_RATIO: f32 = 0.5;
/// ...and below which it accelerates (pure echo residual).
const ACCELERATE_RATIO: f32 = 0.1;
const ACCELERATE_FACTOR: f32 = 1.5;
/// One-pole coefficient for the power trackers.
const POWER_SMOOTHING: f32 = 0.999;

pub struct AdaptiveAec {
    frame_len: usize,
    sample_rate: u32,
    taps: usize,
    weights: Vec<f32>,
    /// Far history, oldest first; kept at a fixed length so reference
    /// indices never underflow.
    history: Vec<f32>,
    history_len: usize,
    delay_samples: usize,
    /// Smoothed reference and residual powers for the double-talk gate.
    far_power: f32,
    err_power: f32,
    high_pass: Option<Biquad>,
    suppressor: Option<ResidualSuppressor>,
}

impl AdaptiveAec {
    pub fn new(cfg: &AecConfig, sample_rate: u32, frame_len: usize) -> Self {
        let taps = (sample_rate as u64 * FILTER_TAPS_48K as u64 / 48_000).max(64) as usize;
        let max_delay = (sample_rate as u64 * MAX_STREAM_DELAY_MS as u64 / 1000) as usize;
        let history_len = taps + max_delay + frame_len;
        let delay_samples =
            (sample_rate as u64 * u64::from(cfg.initial_delay_ms.min(MAX_STREAM_DELAY_MS)) / 1000)
                as usize;

        Self {
            frame_len,
            sample_rate,
            taps,
            weights: vec![0.0; taps],
            history: vec![0.0; history_len],
            history_len,
            delay_samples,
            far_power: 0.0,
            err_power: 0.0,
            high_pass: cfg
                .high_pass
                .then(|| Biquad::high_pass(sample_rate, cfg.high_pass_hz)),
            suppressor: (cfg.suppression_level == SuppressionLevel::VeryHigh)
                .then(|| ResidualSuppressor::new(frame_len)),
        }
    }

    pub fn taps(&self) -> usize {
        self.taps
    }

    /// Reference sample aligned with near sample `k` of the current frame.
    #[inline]
    fn reference_base(&self, k: usize) -> usize {
        self.history_len - self.frame_len + k - self.delay_samples
    }
}

impl EchoCanceller for AdaptiveAec {
    fn feed_far(&mut self, frame: &[f32]) {
        self.history.extend_from_slice(frame);
        let excess = self.history.len() - self.history_len;
        if excess > 0 {
            self.history.drain(..excess);
        }
    }

    fn process_near(&mut self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), self.frame_len);
        debug_assert_eq!(output.len(), self.frame_len);

        for k in 0..self.frame_len {
            let base = self.reference_base(k);
            let window = &self.history[base + 1 - self.taps..=base];

            // Filter output and reference norm in one pass. `window` is
            // oldest-first; tap 0 multiplies the newest reference sample.
            let mut estimate = 0f32;
            let mut norm = 0f32;
            for (j, &x) in window.iter().rev().enumerate() {
                estimate += self.weights[j] * x;
                norm += x * x;
            }

            let error = input[k] - estimate;
            output[k] = error;

            let aligned = self.history[base];
            self.far_power =
                POWER_SMOOTHING * self.far_power + (1.0 - POWER_SMOOTHING) * aligned * aligned;
            self.err_power =
                POWER_SMOOTHING * self.err_power + (1.0 - POWER_SMOOTHING) * error * error;

            let ratio = self.err_power / self.far_power.max(REGULARIZATION);
            let mu = if ratio > FREEZE_RATIO {
                continue; // double talk: leave the weights alone
            } else if ratio < ACCELERATE_RATIO {
                STEP_SIZE * ACCELERATE_FACTOR
            } else {
                STEP_SIZE
            };

            let scale = mu * error / (REGULARIZATION + norm);
            for (j, &x) in window.iter().rev().enumerate() {
                let delta = (scale * x).clamp(-GRADIENT_CLIP, GRADIENT_CLIP);
                self.weights[j] = (self.weights[j] + delta).clamp(-WEIGHT_CLIP, WEIGHT_CLIP);
            }
        }

        if let Some(ref mut high_pass) = self.high_pass {
            high_pass.process(output);
        }
        if self.suppressor.is_some() {
            let base = self.reference_base(0);
            let reference = self.history[base..base + self.frame_len].to_vec();
            if let Some(ref mut suppressor) = self.suppressor {
                suppressor.process(output, &reference);
            }
        }
    }

    fn set_stream_delay_ms(&mut self, delay_ms: u16) {
        let clamped = delay_ms.min(MAX_STREAM_DELAY_MS);
        self.delay_samples = (self.sample_rate as u64 * u64::from(clamped) / 1000) as usize;
    }

    fn kind(&self) -> AecKind {
        AecKind::Adaptive
    }
}

/// Energy-gated spectral-subtraction residual suppressor.
///
/// Only engaged at the highest suppression level, and only on frames whose
/// residual is echo-dominated: far clearly active, residual well below the
/// reference. Per-frame magnitude subtraction with a spectral floor keeps
/// artifacts bounded.
struct ResidualSuppressor {
    fft_size: usize,
    frame_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    residual_bins: Vec<Complex<f32>>,
    reference_bins: Vec<Complex<f32>>,
}

/// Residual-to-reference energy ratio below which a frame counts as
/// echo-dominated.
const SUPPRESS_GATE_RATIO: f32 = 0.25;
/// Reference energy floor for the gate (silence never triggers it).
const SUPPRESS_GATE_FLOOR: f32 = 1e-6;
/// Fraction of the residual magnitude always retained.
const SPECTRAL_FLOOR: f32 = 0.1;

impl ResidualSuppressor {
    fn new(frame_len: usize) -> Self {
        let fft_size = frame_len.next_power_of_two();
        let mut planner = FftPlanner::new();
        Self {
            fft_size,
            frame_len,
            forward: planner.plan_fft_forward(fft_size),
            inverse: planner.plan_fft_inverse(fft_size),
            residual_bins: vec![Complex::new(0.0, 0.0); fft_size],
            reference_bins: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    fn process(&mut self, residual: &mut [f32], reference: &[f32]) {
        let ref_energy: f32 = reference.iter().map(|x| x * x).sum();
        let res_energy: f32 = residual.iter().map(|x| x * x).sum();
        if ref_energy < SUPPRESS_GATE_FLOOR || res_energy > SUPPRESS_GATE_RATIO * ref_energy {
            return;
        }

        for (bin, value) in self.residual_bins.iter_mut().zip(
            residual
                .iter()
                .copied()
                .chain(std::iter::repeat(0.0))
                .take(self.fft_size),
        ) {
            *bin = Complex::new(value, 0.0);
        }
        for (bin, value) in self.reference_bins.iter_mut().zip(
            reference
                .iter()
                .copied()
                .chain(std::iter::repeat(0.0))
                .take(self.fft_size),
        ) {
            *bin = Complex::new(value, 0.0);
        }
        self.forward.process(&mut self.residual_bins);
        self.forward.process(&mut self.reference_bins);

        // Scale the reference magnitude by the observed coupling so we
        // subtract roughly what leaked, not the full render level.
        let coupling = (res_energy / ref_energy).sqrt();
        for (res, reference) in self.residual_bins.iter_mut().zip(&self.reference_bins) {
            let magnitude = res.norm();
            if magnitude <= 0.0 {
                continue;
            }
            let subtracted =
                (magnitude - coupling * reference.norm()).max(SPECTRAL_FLOOR * magnitude);
            *res *= subtracted / magnitude;
        }

        self.inverse.process(&mut self.residual_bins);
        let scale = 1.0 / self.fft_size as f32;
        for (out, bin) in residual
            .iter_mut()
            .zip(self.residual_bins.iter().take(self.frame_len))
        {
            *out = bin.re * scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::rms;
    use std::f32::consts::PI;

    const RATE: u32 = 48_000;
    const FRAME: usize = 480;

    fn sine(amplitude: f32, freq: f32, n0: usize, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| amplitude * (2.0 * PI * freq * (n0 + n) as f32 / RATE as f32).sin())
            .collect()
    }

    fn cfg() -> AecConfig {
        AecConfig {
            high_pass: false,
            ..AecConfig::default()
        }
    }

    /// Pure echo path: far tone leaking into near at 45 ms. With the stream
    /// delay hinted, cancellation has to reach 20 dB ERLE.
    #[test]
    fn cancels_delayed_echo_beyond_20_db() {
        let mut aec = AdaptiveAec::new(&cfg(), RATE, FRAME);
        aec.set_stream_delay_ms(45);
        let delay = (RATE as usize * 45) / 1000;

        let frames = 600usize;
        let mut raw_energy = 0f64;
        let mut residual_energy = 0f64;
        let measure_from = 500usize;

        let mut output = vec![0.0f32; FRAME];
        for frame in 0..frames {
            let n0 = frame * FRAME;
            let far = sine(0.5, 1_000.0, n0, FRAME);
            // The echo the mic picks up: far from 45 ms ago, attenuated.
            let near: Vec<f32> = (0..FRAME)
                .map(|k| {
                    let n = n0 + k;
                    if n >= delay {
                        0.2 * (2.0 * PI * 1_000.0 * (n - delay) as f32 / RATE as f32).sin()
                    } else {
                        0.0
                    }
                })
                .collect();

            aec.feed_far(&far);
            aec.process_near(&near, &mut output);

            if frame >= measure_from {
                raw_energy += near.iter().map(|x| (*x as f64).powi(2)).sum::<f64>();
                residual_energy += output.iter().map(|x| (*x as f64).powi(2)).sum::<f64>();
            }
        }

        let erle_db = 10.0 * (raw_energy / residual_energy.max(1e-12)).log10();
        assert!(erle_db >= 20.0, "ERLE {erle_db:.1} dB < 20 dB");
    }

    #[test]
    fn double_talk_freezes_adaptation() {
        let mut aec = AdaptiveAec::new(&cfg(), RATE, FRAME);
        // Prime the power trackers with loud near speech over a quiet far
        // reference; the gate must keep the weights at zero.
        let mut output = vec![0.0f32; FRAME];
        for frame in 0..50 {
            let n0 = frame * FRAME;
            let far = sine(0.01, 1_000.0, n0, FRAME);
            let near = sine(0.8, 300.0, n0, FRAME);
            aec.feed_far(&far);
            aec.process_near(&near, &mut output);
        }
        let weight_norm: f32 = aec.weights.iter().map(|w| w * w).sum();
        assert!(weight_norm < 1e-3, "weights moved under double talk: {weight_norm}");
        // Near speech passes essentially untouched.
        let near = sine(0.8, 300.0, 50 * FRAME, FRAME);
        aec.feed_far(&sine(0.01, 1_000.0, 50 * FRAME, FRAME));
        aec.process_near(&near, &mut output);
        assert!((rms(&output) - rms(&near)).abs() < 0.05);
    }

    #[test]
    fn zero_far_reference_is_identity() {
        let mut aec = AdaptiveAec::new(&cfg(), RATE, FRAME);
        let near = sine(0.4, 440.0, 0, FRAME);
        let mut output = vec![0.0f32; FRAME];
        aec.feed_far(&vec![0.0; FRAME]);
        aec.process_near(&near, &mut output);
        assert_eq!(near, output);
    }

    #[test]
    fn delay_clamps_to_200_ms() {
        let mut aec = AdaptiveAec::new(&cfg(), RATE, FRAME);
        aec.set_stream_delay_ms(1_000);
        assert_eq!(aec.delay_samples, (RATE as usize * 200) / 1000);
    }

    #[test]
    fn suppressor_attenuates_echo_dominated_residual() {
        let mut suppressor = ResidualSuppressor::new(FRAME);
        let reference = sine(0.5, 1_000.0, 0, FRAME);
        let mut residual: Vec<f32> = reference.iter().map(|x| x * 0.2).collect();
        let before = rms(&residual);
        suppressor.process(&mut residual, &reference);
        let after = rms(&residual);
        assert!(after < before * 0.5, "no suppression: {before} -> {after}");
    }

    #[test]
    fn suppressor_leaves_double_talk_untouched() {
        let mut suppressor = ResidualSuppressor::new(FRAME);
        let reference = sine(0.1, 1_000.0, 0, FRAME);
        let mut residual = sine(0.8, 300.0, 0, FRAME);
        let before = residual.clone();
        suppressor.process(&mut residual, &reference);
        assert_eq!(before, residual);
    }
}
