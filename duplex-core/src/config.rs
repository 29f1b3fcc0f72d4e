//! Session configuration.
//!
//! Every knob the core recognises lives here, grouped the way the pipeline
//! consumes them. Unknown or out-of-range values never abort a session:
//! `SessionConfig::normalize()` coerces them to safe defaults and logs one
//! informational line per coercion, so a recording always starts with a
//! consistent snapshot.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Sample rates the pipeline runs at natively. Anything else is re-mapped
/// to the preferred rate.
pub const PREFERRED_SAMPLE_RATE: u32 = 48_000;
pub const ACCEPTED_SAMPLE_RATES: [u32; 2] = [48_000, 44_100];

/// Output sample container for the stereo artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitDepth {
    /// 16-bit signed PCM with dither.
    Pcm16,
    /// 32-bit IEEE float, written verbatim.
    Float32,
}

/// Dither noise shape applied before 16-bit quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DitherKind {
    TriangularPdf,
    RectangularPdf,
}

/// Echo suppression aggressiveness, forwarded to the echo canceller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressionLevel {
    Low,
    Moderate,
    High,
    VeryHigh,
}

/// Sink location, output format and initial discard window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RecordingConfig {
    /// Root directory; segments land under `Calls/YYYY/MM/DD/`.
    pub output_dir: PathBuf,
    /// Pipeline rate. 48 000 Hz preferred, 44 100 Hz accepted.
    pub sample_rate: u32,
    pub bits_per_sample: BitDepth,
    /// Accumulator pre-sizing hint in seconds.
    pub pre_buffer_s: f32,
    /// Milliseconds discarded from the head of each side at session start.
    pub discard_initial_ms: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            sample_rate: PREFERRED_SAMPLE_RATE,
            bits_per_sample: BitDepth::Pcm16,
            pre_buffer_s: 2.0,
            discard_initial_ms: 0,
        }
    }
}

/// Framing and gain staging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DspConfig {
    /// Frame duration in milliseconds. Default: 10.
    pub frame_ms: u32,
    pub near_gain_db: f32,
    pub far_gain_db: f32,
    /// Enable dynamic RMS normalization.
    pub normalize: bool,
    pub target_rms_dbfs: f32,
    pub max_gain_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            frame_ms: 10,
            near_gain_db: 0.0,
            far_gain_db: 0.0,
            normalize: false,
            target_rms_dbfs: -20.0,
            max_gain_db: 12.0,
            attack_ms: 50.0,
            release_ms: 300.0,
        }
    }
}

/// Post low-pass filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct FilterConfig {
    pub low_pass: bool,
    /// Cutoff in Hz, clamped to `[2000, rate/2 - 100]`.
    pub low_pass_hz: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            low_pass: false,
            low_pass_hz: 9_000.0,
        }
    }
}

/// Lookahead peak control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct LimiterConfig {
    pub enabled: bool,
    pub ceiling_dbfs: f32,
    pub lookahead_ms: f32,
    pub release_ms: f32,
    pub soft_knee: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ceiling_dbfs: -1.0,
            lookahead_ms: 4.0,
            release_ms: 50.0,
            soft_knee: false,
        }
    }
}

/// Quantization noise shaping for 16-bit output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DitherConfig {
    pub enabled: bool,
    pub kind: DitherKind,
    pub amount_db: f32,
}

impl Default for DitherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: DitherKind::TriangularPdf,
            amount_db: -96.0,
        }
    }
}

/// Echo cancellation, delegated to the AEC port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AecConfig {
    pub echo_cancellation: bool,
    pub suppression_level: SuppressionLevel,
    /// Initial render-to-capture delay hint in milliseconds.
    pub initial_delay_ms: u16,
    pub high_pass: bool,
    pub high_pass_hz: f32,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            suppression_level: SuppressionLevel::Moderate,
            initial_delay_ms: 0,
            high_pass: true,
            high_pass_hz: 80.0,
        }
    }
}

/// Optional observability artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DiagConfig {
    /// Write `near_raw` / `near_processed` / `far` mono dump WAVs beside the
    /// main artifact.
    pub enable_mono_dumps: bool,
    /// Compute a test-tone pass/fail verdict at finalize.
    pub test_tone_check: bool,
}

/// Finalization behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct FinalizeConfig {
    /// Run two-pass offline normalization on the merged file.
    pub post_normalize: bool,
}

/// Complete configuration snapshot owned by a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    pub recording: RecordingConfig,
    pub dsp: DspConfig,
    pub filter: FilterConfig,
    pub limiter: LimiterConfig,
    pub dither: DitherConfig,
    pub aec: AecConfig,
    pub diagnostics: DiagConfig,
    pub finalize: FinalizeConfig,
}

impl SessionConfig {
    /// Coerce every field into its supported range.
    ///
    /// Unsupported values never fail a session; they are replaced with the
    /// nearest safe value and logged once.
    pub fn normalize(&mut self) {
        if !ACCEPTED_SAMPLE_RATES.contains(&self.recording.sample_rate) {
            info!(
                requested = self.recording.sample_rate,
                coerced = PREFERRED_SAMPLE_RATE,
                "unsupported pipeline sample rate, coercing"
            );
            self.recording.sample_rate = PREFERRED_SAMPLE_RATE;
        }
        if self.dsp.frame_ms == 0 {
            info!("frame_ms of 0 coerced to 1");
            self.dsp.frame_ms = 1;
        }
        self.recording.pre_buffer_s = self.recording.pre_buffer_s.clamp(0.0, 30.0);

        let nyquist_margin = self.recording.sample_rate as f32 / 2.0 - 100.0;
        let clamped = self.filter.low_pass_hz.clamp(2_000.0, nyquist_margin);
        if self.filter.low_pass && clamped != self.filter.low_pass_hz {
            info!(
                requested = self.filter.low_pass_hz,
                coerced = clamped,
                "low-pass cutoff out of range, clamping"
            );
        }
        self.filter.low_pass_hz = clamped;

        self.dsp.attack_ms = self.dsp.attack_ms.max(1.0);
        self.dsp.release_ms = self.dsp.release_ms.max(1.0);
        self.dsp.max_gain_db = self.dsp.max_gain_db.clamp(0.0, 60.0);
        self.dsp.target_rms_dbfs = self.dsp.target_rms_dbfs.clamp(-60.0, -3.0);

        self.limiter.ceiling_dbfs = self.limiter.ceiling_dbfs.clamp(-20.0, 0.0);
        self.limiter.lookahead_ms = self.limiter.lookahead_ms.clamp(1.0, 10.0);
        self.limiter.release_ms = self.limiter.release_ms.max(1.0);

        self.dither.amount_db = self.dither.amount_db.clamp(-120.0, -20.0);

        self.aec.initial_delay_ms = self.aec.initial_delay_ms.min(200);
        self.aec.high_pass_hz = self.aec.high_pass_hz.clamp(20.0, 400.0);
    }

    /// Samples per mono frame at the configured rate.
    pub fn frame_samples(&self) -> usize {
        (self.recording.sample_rate as u64 * self.dsp.frame_ms as u64 / 1000).max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_is_480_samples_at_48k() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.frame_samples(), 480);
    }

    #[test]
    fn unsupported_rate_coerces_to_48k() {
        let mut cfg = SessionConfig::default();
        cfg.recording.sample_rate = 32_000;
        cfg.normalize();
        assert_eq!(cfg.recording.sample_rate, 48_000);
    }

    #[test]
    fn accepted_rates_pass_through() {
        for rate in [44_100, 48_000] {
            let mut cfg = SessionConfig::default();
            cfg.recording.sample_rate = rate;
            cfg.normalize();
            assert_eq!(cfg.recording.sample_rate, rate);
        }
    }

    #[test]
    fn zero_frame_ms_coerces_to_one() {
        let mut cfg = SessionConfig::default();
        cfg.dsp.frame_ms = 0;
        cfg.normalize();
        assert_eq!(cfg.dsp.frame_ms, 1);
    }

    #[test]
    fn low_pass_cutoff_clamps_below_nyquist() {
        let mut cfg = SessionConfig::default();
        cfg.filter.low_pass = true;
        cfg.filter.low_pass_hz = 40_000.0;
        cfg.normalize();
        assert_eq!(cfg.filter.low_pass_hz, 23_900.0);

        cfg.filter.low_pass_hz = 100.0;
        cfg.normalize();
        assert_eq!(cfg.filter.low_pass_hz, 2_000.0);
    }

    #[test]
    fn config_round_trips_through_json_with_camel_case() {
        let cfg = SessionConfig::default();
        let json = serde_json::to_value(&cfg).expect("serialize config");
        assert_eq!(json["recording"]["sampleRate"], 48_000);
        assert_eq!(json["recording"]["bitsPerSample"], "pcm16");
        assert_eq!(json["dsp"]["frameMs"], 10);

        let back: SessionConfig = serde_json::from_value(json).expect("deserialize config");
        assert_eq!(back.recording.sample_rate, 48_000);
        assert_eq!(back.limiter.enabled, cfg.limiter.enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let back: SessionConfig =
            serde_json::from_str(r#"{"dsp":{"nearGainDb":3.0}}"#).expect("partial config");
        assert_eq!(back.dsp.near_gain_db, 3.0);
        assert_eq!(back.dsp.frame_ms, 10);
        assert_eq!(back.recording.sample_rate, 48_000);
    }
}
