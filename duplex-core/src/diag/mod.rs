//! Pipeline diagnostics.
//!
//! Running sums over every processed pair, a ~1 s derived log line, and the
//! optional test-tone verdict. The accumulators live under the session
//! mutex, so plain fields are enough; `snapshot()` produces the copyable
//! view embedded in the finalize result.

pub mod analysis;
pub mod dumps;

use serde::Serialize;
use tracing::debug;

const EPSILON: f64 = 1e-12;
/// Derived metrics are logged every this many pairs (~1 s at 10 ms).
const LOG_INTERVAL_FRAMES: u64 = 100;

/// Test-tone verdict thresholds.
const TONE_MIN_ERLE_DB: f64 = 20.0;
const TONE_MAX_LEAK_CORR_DB: f64 = -35.0;
const TONE_MIN_LEVEL_SEPARATION_DB: f64 = 35.0;

#[derive(Debug, Default)]
pub struct Diagnostics {
    sum_near_raw_sq: f64,
    sum_near_proc_sq: f64,
    sum_far_sq: f64,
    sum_far_near_proc: f64,
    sum_far_near_raw: f64,
    clip_hits_near: u64,
    clip_hits_far: u64,
    frames_processed: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one pair: raw near (pre-AEC), processed near (post-AEC),
    /// and the far reference.
    pub fn record_pair(&mut self, near_raw: &[f32], near_proc: &[f32], far: &[f32]) {
        for i in 0..near_raw.len().min(near_proc.len()).min(far.len()) {
            let raw = f64::from(near_raw[i]);
            let proc = f64::from(near_proc[i]);
            let far_s = f64::from(far[i]);
            self.sum_near_raw_sq += raw * raw;
            self.sum_near_proc_sq += proc * proc;
            self.sum_far_sq += far_s * far_s;
            self.sum_far_near_proc += far_s * proc;
            self.sum_far_near_raw += far_s * raw;
        }
        self.frames_processed += 1;
    }

    pub fn record_clips(&mut self, near: u64, far: u64) {
        self.clip_hits_near += near;
        self.clip_hits_far += far;
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Echo return loss enhancement in dB.
    pub fn erle_db(&self) -> f64 {
        10.0 * ((self.sum_near_raw_sq + EPSILON) / (self.sum_near_proc_sq + EPSILON)).log10()
    }

    /// Residual far/near correlation after processing, clamped to [-1, 1].
    pub fn leak_corr(&self) -> f64 {
        let denom = (self.sum_far_sq * self.sum_near_proc_sq).sqrt();
        if denom <= 0.0 {
            return 0.0;
        }
        (self.sum_far_near_proc / denom).clamp(-1.0, 1.0)
    }

    pub fn leak_corr_db(&self) -> f64 {
        20.0 * self.leak_corr().abs().max(1e-9).log10()
    }

    /// Far/near correlation before processing, in dB.
    pub fn leak_raw_db(&self) -> f64 {
        let denom = (self.sum_far_sq * self.sum_near_raw_sq).sqrt();
        if denom <= 0.0 {
            return -180.0;
        }
        let corr = (self.sum_far_near_raw / denom).clamp(-1.0, 1.0);
        20.0 * corr.abs().max(1e-9).log10()
    }

    /// Energy separation between the far reference and the processed near
    /// channel, in dB.
    pub fn far_near_level_db(&self) -> f64 {
        10.0 * ((self.sum_far_sq + EPSILON) / (self.sum_near_proc_sq + EPSILON)).log10()
    }

    /// Emit the derived line once per interval.
    pub fn maybe_log(&self, reverse_fill: usize, stream_delay_ms: u16) {
        if self.frames_processed == 0 || self.frames_processed % LOG_INTERVAL_FRAMES != 0 {
            return;
        }
        debug!(
            frames = self.frames_processed,
            erle_db = format_args!("{:.1}", self.erle_db()),
            leak_corr = format_args!("{:.4}", self.leak_corr()),
            leak_raw_db = format_args!("{:.1}", self.leak_raw_db()),
            reverse_fill,
            stream_delay_ms,
            "pipeline diagnostics"
        );
    }

    pub fn snapshot(&self, reverse_drops: u64, reverse_underruns: u64) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            erle_db: self.erle_db(),
            leak_corr: self.leak_corr(),
            leak_corr_db: self.leak_corr_db(),
            leak_raw_db: self.leak_raw_db(),
            clip_hits_near: self.clip_hits_near,
            clip_hits_far: self.clip_hits_far,
            frames_processed: self.frames_processed,
            reverse_drops,
            reverse_underruns,
        }
    }

    /// Pass/fail verdict for a test-tone run.
    pub fn tone_check(&self) -> ToneCheck {
        let erle_db = self.erle_db();
        let leak_corr_db = self.leak_corr_db();
        let far_near_level_db = self.far_near_level_db();
        let pass = erle_db >= TONE_MIN_ERLE_DB
            && leak_corr_db <= TONE_MAX_LEAK_CORR_DB
            && far_near_level_db >= TONE_MIN_LEVEL_SEPARATION_DB;

        // Most-likely-cause checks, most fundamental first.
        let diagnosis = if pass {
            None
        } else if erle_db < 3.0 && self.leak_raw_db() > -20.0 {
            Some("reverse-before-process ordering")
        } else if erle_db < TONE_MIN_ERLE_DB {
            Some("delay misalignment")
        } else if self.leak_raw_db() > TONE_MAX_LEAK_CORR_DB {
            Some("sidetone/monitoring path")
        } else {
            Some("virtual-device leakage")
        };

        ToneCheck {
            pass,
            erle_db,
            leak_corr_db,
            far_near_level_db,
            diagnosis: diagnosis.map(str::to_owned),
        }
    }
}

/// Copyable view of the accumulators, embedded in `FinalizeResult`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub erle_db: f64,
    pub leak_corr: f64,
    pub leak_corr_db: f64,
    pub leak_raw_db: f64,
    pub clip_hits_near: u64,
    pub clip_hits_far: u64,
    pub frames_processed: u64,
    pub reverse_drops: u64,
    pub reverse_underruns: u64,
}

/// Result of the optional test-tone validation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToneCheck {
    pub pass: bool,
    pub erle_db: f64,
    pub leak_corr_db: f64,
    pub far_near_level_db: f64,
    pub diagnosis: Option<String>,
}
