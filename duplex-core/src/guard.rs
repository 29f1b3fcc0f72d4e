//! Leakage guard: sidetone detection at startup, coherence monitoring at
//! runtime.
//!
//! Both phases share one qualifying predicate — near effectively silent
//! while far is clearly active — and correlate far against the raw near
//! frame (the guard sits upstream of the echo canceller). The startup phase
//! decides once whether a monitoring/sidetone path contaminates the capture
//! graph; the runtime phase watches for creeping coherence and widens the
//! stream-delay hint before giving up.

use tracing::{error, warn};

use crate::dsp::rms_dbfs;

const NEAR_SILENT_DBFS: f32 = -45.0;
const FAR_ACTIVE_DBFS: f32 = -35.0;
/// Length of the startup observation window.
const STARTUP_MS: u32 = 4_000;
/// Mean |r| over qualifying startup pairs above which recording is refused.
const STARTUP_CORR_LIMIT: f64 = 0.2;
/// Runtime coherence threshold, in dB of |r|.
const LEAKAGE_THRESHOLD_DB: f32 = -25.0;
/// Runtime window length in pairs (~1 s at 10 ms framing).
const RUNTIME_WINDOW_FRAMES: u32 = 100;
/// High-leakage pairs per window that trigger a delay bump.
const HIGH_FRAME_LIMIT: u32 = 70;
const DELAY_BUMP_STEP_MS: u16 = 15;
/// Total bump at which the guard blocks permanently.
const DELAY_BUMP_BLOCK_MS: u16 = 45;
/// Pairs between re-issues of the actionable guidance while blocked.
const GUIDANCE_INTERVAL_FRAMES: u64 = 500;

pub const GUIDANCE: &str = "far-end audio is leaking into the capture path; \
    disable microphone monitoring/sidetone or remove the virtual loopback \
    device, then start a new session";

pub struct LeakageGuard {
    startup_remaining: u32,
    startup_corr_sum: f64,
    startup_qualifying: u64,
    window_frames: u32,
    high_frames: u32,
    delay_bump_ms: u16,
    blocked: bool,
    frames_since_guidance: u64,
}

impl LeakageGuard {
    pub fn new(frame_ms: u32) -> Self {
        Self {
            startup_remaining: STARTUP_MS / frame_ms.max(1),
            startup_corr_sum: 0.0,
            startup_qualifying: 0,
            window_frames: 0,
            high_frames: 0,
            delay_bump_ms: 0,
            blocked: false,
            frames_since_guidance: 0,
        }
    }

    pub fn blocked(&self) -> bool {
        self.blocked
    }

    pub fn delay_bump_ms(&self) -> u16 {
        self.delay_bump_ms
    }

    /// Observe one aligned pair (raw near, far reference).
    pub fn observe(&mut self, near_raw: &[f32], far: &[f32]) {
        if self.blocked {
            return;
        }

        let qualifying =
            rms_dbfs(near_raw) < NEAR_SILENT_DBFS && rms_dbfs(far) > FAR_ACTIVE_DBFS;

        if self.startup_remaining > 0 {
            self.startup_remaining -= 1;
            if qualifying {
                self.startup_corr_sum += f64::from(frame_correlation(far, near_raw).abs());
                self.startup_qualifying += 1;
            }
            if self.startup_remaining == 0 {
                self.evaluate_startup();
            }
            return;
        }

        self.window_frames += 1;
        if qualifying {
            let coherence_db = 20.0 * frame_correlation(far, near_raw).abs().max(1e-9).log10();
            if coherence_db > LEAKAGE_THRESHOLD_DB {
                self.high_frames += 1;
            }
        }
        if self.window_frames >= RUNTIME_WINDOW_FRAMES {
            if self.high_frames > HIGH_FRAME_LIMIT {
                self.delay_bump_ms += DELAY_BUMP_STEP_MS;
                warn!(
                    high_frames = self.high_frames,
                    delay_bump_ms = self.delay_bump_ms,
                    "sustained far/near coherence, widening stream delay"
                );
                if self.delay_bump_ms >= DELAY_BUMP_BLOCK_MS {
                    self.blocked = true;
                    error!("leakage persists despite delay widening; {GUIDANCE}");
                }
            }
            self.window_frames = 0;
            self.high_frames = 0;
        }
    }

    fn evaluate_startup(&mut self) {
        if self.startup_qualifying == 0 {
            return;
        }
        let mean = self.startup_corr_sum / self.startup_qualifying as f64;
        if mean > STARTUP_CORR_LIMIT {
            self.blocked = true;
            error!(
                mean_correlation = mean,
                qualifying_pairs = self.startup_qualifying,
                "sidetone detected during startup; {GUIDANCE}"
            );
        }
    }

    /// Rate-limits the actionable message while pairs are being dropped.
    pub fn should_reissue_guidance(&mut self) -> bool {
        if !self.blocked {
            return false;
        }
        self.frames_since_guidance += 1;
        if self.frames_since_guidance >= GUIDANCE_INTERVAL_FRAMES {
            self.frames_since_guidance = 0;
            true
        } else {
            false
        }
    }
}

/// Zero-lag Pearson correlation of two equal-length frames.
///
/// Degenerate convention: a digitally dead near frame (zero variance)
/// against an active far frame counts as full coherence — the capture path
/// is not delivering an independent signal, which is exactly what the
/// startup refusal exists to catch.
fn frame_correlation(far: &[f32], near: &[f32]) -> f32 {
    let n = far.len().min(near.len());
    if n == 0 {
        return 0.0;
    }
    let mean_far = far[..n].iter().sum::<f32>() / n as f32;
    let mean_near = near[..n].iter().sum::<f32>() / n as f32;

    let mut num = 0f64;
    let mut var_far = 0f64;
    let mut var_near = 0f64;
    for i in 0..n {
        let df = f64::from(far[i] - mean_far);
        let dn = f64::from(near[i] - mean_near);
        num += df * dn;
        var_far += df * df;
        var_near += dn * dn;
    }

    if var_far <= 0.0 {
        return 0.0;
    }
    if var_near <= 0.0 {
        return 1.0;
    }
    (num / (var_far * var_near).sqrt()) as f32
}
