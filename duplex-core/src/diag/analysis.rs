//! Offline analysis of a finished stereo artifact.
//!
//! Re-reads the file the writer produced and derives the quality metrics a
//! human would reach for first: per-channel levels, noise floor, clipping
//! census, and the cross-channel coherence that reveals leakage between the
//! mic and loopback paths.

use std::path::Path;

use anyhow::anyhow;
use hound::{SampleFormat, WavReader};
use serde::Serialize;

use crate::error::Result;

/// Samples above this magnitude count as clipped.
const CLIP_THRESHOLD: f32 = 0.95;
/// Noise-floor estimation window.
const FLOOR_WINDOW_MS: u32 = 50;
/// Quietest-window percentile used as the floor estimate.
const FLOOR_PERCENTILE: f64 = 0.2;
/// Correlation search range for the best inter-channel lag.
const MAX_LAG_MS: u32 = 200;
/// Cross-correlation is evaluated over at most this much audio.
const CORR_SPAN_S: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub rms_dbfs: f64,
    pub peak_dbfs: f64,
    pub dc_offset: f64,
    pub noise_floor_dbfs: f64,
    pub clipped_samples: u64,
    pub clipped_pct: f64,
    pub dynamic_range_db: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StereoAnalysis {
    pub sample_rate: u32,
    pub duration_s: f64,
    pub left: ChannelStats,
    pub right: ChannelStats,
    /// Zero-lag correlation between the channels.
    pub zero_lag_corr: f64,
    /// Lag (right leading left, in milliseconds) with the strongest
    /// correlation.
    pub best_lag_ms: f64,
    pub best_lag_corr: f64,
    /// Least-squares gain of right into left, in dB.
    pub leakage_gain_db: f64,
}

/// Analyze a stereo WAV produced by the pipeline.
pub fn analyze_file(path: &Path) -> Result<StereoAnalysis> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 2 {
        return Err(anyhow!("expected stereo WAV, got {} channels", spec.channels).into());
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader.samples::<f32>().map(|s| s.unwrap_or(0.0)).collect(),
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.unwrap_or(0) as f32 / 32_768.0)
            .collect(),
        (format, bits) => {
            return Err(anyhow!("unsupported WAV layout: {format:?} at {bits} bits").into())
        }
    };

    let frames = interleaved.len() / 2;
    let mut left = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    for pair in interleaved.chunks_exact(2) {
        left.push(pair[0]);
        right.push(pair[1]);
    }

    let span = (spec.sample_rate as usize * CORR_SPAN_S as usize).min(frames);
    let left_head = &left[..span];
    let right_head = &right[..span];
    let (best_lag, best_lag_corr) = best_lag(left_head, right_head, spec.sample_rate);

    Ok(StereoAnalysis {
        sample_rate: spec.sample_rate,
        duration_s: frames as f64 / f64::from(spec.sample_rate),
        left: channel_stats(&left, spec.sample_rate),
        right: channel_stats(&right, spec.sample_rate),
        zero_lag_corr: correlation_at_lag(left_head, right_head, 0),
        best_lag_ms: best_lag as f64 * 1000.0 / f64::from(spec.sample_rate),
        best_lag_corr,
        leakage_gain_db: leakage_gain_db(&left, &right),
    })
}

fn channel_stats(samples: &[f32], sample_rate: u32) -> ChannelStats {
    let rms = rms(samples);
    let peak = samples.iter().fold(0f64, |m, &s| m.max(f64::from(s.abs())));
    let dc = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|&s| f64::from(s)).sum::<f64>() / samples.len() as f64
    };
    let clipped = samples
        .iter()
        .filter(|s| s.abs() >= CLIP_THRESHOLD)
        .count() as u64;
    let clipped_pct = if samples.is_empty() {
        0.0
    } else {
        clipped as f64 * 100.0 / samples.len() as f64
    };
    let dynamic_range_db = if rms > 0.0 && peak > 0.0 {
        dbfs(peak) - dbfs(rms)
    } else {
        0.0
    };

    ChannelStats {
        rms_dbfs: dbfs(rms),
        peak_dbfs: dbfs(peak),
        dc_offset: dc,
        noise_floor_dbfs: noise_floor_dbfs(samples, sample_rate),
        clipped_samples: clipped,
        clipped_pct,
        dynamic_range_db,
    }
}

/// RMS of the quietest percentile of short windows.
fn noise_floor_dbfs(samples: &[f32], sample_rate: u32) -> f64 {
    let window = ((sample_rate as u64 * u64::from(FLOOR_WINDOW_MS)) / 1000).max(1) as usize;
    if samples.len() < window {
        return dbfs(rms(samples));
    }
    let mut window_rms: Vec<f64> = samples
        .chunks_exact(window)
        .map(|w| rms(w))
        .collect();
    if window_rms.is_empty() {
        return dbfs(rms(samples));
    }
    window_rms.sort_by(|a, b| a.total_cmp(b));
    let idx = ((window_rms.len() as f64 * FLOOR_PERCENTILE) as usize)
        .saturating_sub(1)
        .min(window_rms.len() - 1);
    dbfs(window_rms[idx])
}

/// Normalized cross-correlation at one lag. Positive lag means the right
/// channel leads the left.
fn correlation_at_lag(left: &[f32], right: &[f32], lag: i64) -> f64 {
    let (a, b): (&[f32], &[f32]) = if lag >= 0 {
        let lag = lag as usize;
        if lag >= left.len() {
            return 0.0;
        }
        (&left[lag..], right)
    } else {
        let lag = (-lag) as usize;
        if lag >= right.len() {
            return 0.0;
        }
        (left, &right[lag..])
    };
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let mean_a = a[..n].iter().map(|&x| f64::from(x)).sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().map(|&x| f64::from(x)).sum::<f64>() / n as f64;
    let mut num = 0f64;
    let mut var_a = 0f64;
    let mut var_b = 0f64;
    for i in 0..n {
        let da = f64::from(a[i]) - mean_a;
        let db = f64::from(b[i]) - mean_b;
        num += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    num / (var_a * var_b).sqrt()
}

fn best_lag(left: &[f32], right: &[f32], sample_rate: u32) -> (i64, f64) {
    let max_lag = (sample_rate as u64 * u64::from(MAX_LAG_MS) / 1000) as i64;
    // Coarse stride keeps the search tractable on long spans.
    let step = (sample_rate as i64 / 12_000).max(1);
    let mut best = (0i64, -2.0f64);
    let mut lag = -max_lag;
    while lag <= max_lag {
        let c = correlation_at_lag(left, right, lag);
        if c > best.1 {
            best = (lag, c);
        }
        lag += step;
    }
    best
}

/// Least-squares estimate of how much of the right channel appears in the
/// left: `left ≈ g * right`, returned as 20·log10(|g|).
fn leakage_gain_db(left: &[f32], right: &[f32]) -> f64 {
    let n = left.len().min(right.len());
    let mut rr = 0f64;
    let mut rt = 0f64;
    for i in 0..n {
        let r = f64::from(right[i]);
        rr += r * r;
        rt += r * f64::from(left[i]);
    }
    if rr <= 0.0 {
        return -999.0;
    }
    let g = (rt / rr).abs();
    if g <= 0.0 {
        -999.0
    } else {
        20.0 * g.log10()
    }
}

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

fn dbfs(x: f64) -> f64 {
    if x <= 0.0 {
        -999.0
    } else {
        20.0 * x.log10()
    }
}
