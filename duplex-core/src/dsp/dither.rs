//! Dithered 16-bit quantization.
//!
//! One dither sample is added per output sample before rounding, then the
//! value is clamped, scaled to 16-bit full scale and rounded half-away-from
//! zero. Float32 output bypasses this module entirely.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::{DitherConfig, DitherKind};
use crate::dsp::db_to_linear;

/// Per-session quantizer. The RNG is owned here so sessions never share
/// dither state.
#[derive(Debug)]
pub struct Quantizer {
    rng: SmallRng,
    kind: Option<DitherKind>,
    amplitude: f32,
}

impl Quantizer {
    pub fn new(cfg: &DitherConfig) -> Self {
        Self {
            rng: SmallRng::from_entropy(),
            kind: cfg.enabled.then_some(cfg.kind),
            amplitude: db_to_linear(cfg.amount_db),
        }
    }

    #[cfg(test)]
    pub fn with_seed(cfg: &DitherConfig, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            kind: cfg.enabled.then_some(cfg.kind),
            amplitude: db_to_linear(cfg.amount_db),
        }
    }

    fn dither_sample(&mut self) -> f32 {
        match self.kind {
            Some(DitherKind::TriangularPdf) => {
                let u1: f32 = self.rng.gen();
                let u2: f32 = self.rng.gen();
                (u1 - u2) * self.amplitude
            }
            Some(DitherKind::RectangularPdf) => {
                let u: f32 = self.rng.gen();
                (u - 0.5) * 2.0 * self.amplitude
            }
            None => 0.0,
        }
    }

    /// Quantize one float sample to little-endian-ready i16.
    pub fn quantize(&mut self, x: f32) -> i16 {
        let dithered = (x + self.dither_sample()).clamp(-1.0, 1.0);
        // f32::round rounds half-way cases away from zero, as required.
        (dithered * 32_767.0).round() as i16
    }

    /// Quantize a whole frame.
    pub fn quantize_frame(&mut self, frame: &[f32], out: &mut Vec<i16>) {
        out.clear();
        out.extend(frame.iter().map(|&x| self.quantize(x)));
    }
}
