//! Dynamic RMS normalization with attack/release smoothing.

use crate::dsp::{db_to_linear, rms_dbfs};

/// Brings frame RMS toward a target level, upward only, with a one-pole
/// smoothed gain so level changes never pump within a syllable.
#[derive(Debug, Clone)]
pub struct RmsNormalizer {
    target_rms_dbfs: f32,
    max_gain_db: f32,
    attack_ms: f32,
    release_ms: f32,
    frame_ms: f32,
    /// Current smoothed gain in dB.
    gain_db: f32,
}

impl RmsNormalizer {
    pub fn new(
        target_rms_dbfs: f32,
        max_gain_db: f32,
        attack_ms: f32,
        release_ms: f32,
        frame_ms: u32,
    ) -> Self {
        Self {
            target_rms_dbfs,
            max_gain_db,
            attack_ms,
            release_ms,
            frame_ms: frame_ms as f32,
            gain_db: 0.0,
        }
    }

    /// Apply the smoothed gain to one frame and advance the envelope.
    pub fn process(&mut self, frame: &mut [f32]) {
        // Floor very quiet frames so the needed-gain math stays finite.
        let current_db = rms_dbfs(frame).max(-90.0);
        let needed_db = (self.target_rms_dbfs - current_db).clamp(0.0, self.max_gain_db);

        let tau = if needed_db > self.gain_db {
            self.attack_ms
        } else {
            self.release_ms
        };
        let coeff = (-self.frame_ms / tau).exp();
        self.gain_db = coeff * self.gain_db + (1.0 - coeff) * needed_db;

        let gain = db_to_linear(self.gain_db);
        for sample in frame.iter_mut() {
            *sample *= gain;
        }
    }

    #[cfg(test)]
    fn gain_db(&self) -> f32 {
        self.gain_db
    }
}
