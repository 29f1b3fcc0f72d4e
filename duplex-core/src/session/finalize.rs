//! Session finalization: drain, merge, optional offline normalization.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{debug, info, warn};

use crate::diag::analysis;
use crate::dsp::db_to_linear;
use crate::error::{DuplexError, Result};

use super::{FinalizeResult, SessionInner};

/// Bounded wait for the writer queue to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Shape factor of the tanh soft clip used by offline normalization.
const SOFT_CLIP_DRIVE: f64 = 1.5;

pub(super) fn run(inner: &mut SessionInner) -> Result<FinalizeResult> {
    // 1. Pad the accumulators so every buffered sample drains, then run the
    //    pipeline one last time.
    inner.pipeline.aligner.pad_to_flush();
    let SessionInner {
        pipeline, writer, ..
    } = inner;
    for pair in pipeline.aligner.drain() {
        pipeline.handle_pair(pair, writer);
    }

    // 2. Bounded writer drain, then close the dumps.
    let segment_paths = inner.writer.finalize(DRAIN_TIMEOUT);
    if let Some(dumps) = inner.pipeline.dumps.take() {
        dumps.finalize();
    }

    // 3. Merge recovery segments back into one artifact.
    let final_path = segment_paths
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("writer produced no segments"))?;
    if segment_paths.len() > 1 {
        merge_segments(&segment_paths)?;
    }

    // 4. Optional two-pass offline normalization.
    if inner.pipeline.cfg.finalize.post_normalize {
        let target = inner.pipeline.cfg.dsp.target_rms_dbfs;
        let ceiling = inner.pipeline.cfg.limiter.ceiling_dbfs;
        if let Err(e) = normalize_file(&final_path, target, ceiling) {
            warn!("offline normalization skipped: {e}");
        }
    }

    // 5. Final diagnostics.
    let pipeline = &inner.pipeline;
    let diagnostics = pipeline.diag.snapshot(
        pipeline.aligner.reverse_drops(),
        pipeline.aligner.reverse_underruns(),
    );
    info!(
        frames = diagnostics.frames_processed,
        erle_db = format_args!("{:.1}", diagnostics.erle_db),
        leak_corr_db = format_args!("{:.1}", diagnostics.leak_corr_db),
        clip_hits_near = diagnostics.clip_hits_near,
        clip_hits_far = diagnostics.clip_hits_far,
        reverse_drops = diagnostics.reverse_drops,
        reverse_underruns = diagnostics.reverse_underruns,
        dropped_frames = inner.writer.dropped_frames(),
        segments = segment_paths.len(),
        "session finalized"
    );

    let tone_check = inner
        .pipeline
        .cfg
        .diagnostics
        .test_tone_check
        .then(|| inner.pipeline.diag.tone_check());
    if let Some(ref check) = tone_check {
        info!(
            pass = check.pass,
            erle_db = format_args!("{:.1}", check.erle_db),
            leak_corr_db = format_args!("{:.1}", check.leak_corr_db),
            diagnosis = check.diagnosis.as_deref().unwrap_or("-"),
            "test-tone verdict"
        );
    }

    let diag_cfg = &inner.pipeline.cfg.diagnostics;
    if diag_cfg.enable_mono_dumps || diag_cfg.test_tone_check {
        match analysis::analyze_file(&final_path) {
            Ok(report) => info!(
                duration_s = format_args!("{:.2}", report.duration_s),
                left_rms_dbfs = format_args!("{:.1}", report.left.rms_dbfs),
                right_rms_dbfs = format_args!("{:.1}", report.right.rms_dbfs),
                leakage_gain_db = format_args!("{:.1}", report.leakage_gain_db),
                "offline analysis"
            ),
            Err(e) => debug!("offline analysis unavailable: {e}"),
        }
    }

    Ok(FinalizeResult {
        final_path,
        segment_paths,
        diagnostics,
        tone_check,
    })
}

/// Concatenate all segments into the first segment's path.
///
/// Every segment must carry the identical format; a mismatch aborts loudly
/// before anything is replaced. The concatenation goes to a `.merge.tmp`
/// sibling which then atomically replaces the final path.
pub(crate) fn merge_segments(segments: &[PathBuf]) -> Result<()> {
    let target = &segments[0];
    let tmp = target.with_extension("merge.tmp");

    let result = merge_into(&tmp, segments);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }

    fs::rename(&tmp, target)?;
    for segment in &segments[1..] {
        if let Err(e) = fs::remove_file(segment) {
            warn!(segment = %segment.display(), "could not remove merged segment: {e}");
        }
    }
    info!(
        target = %target.display(),
        merged = segments.len(),
        "segments merged"
    );
    Ok(())
}

fn merge_into(tmp: &Path, segments: &[PathBuf]) -> Result<()> {
    let expected = WavReader::open(&segments[0])?.spec();
    let mut writer = WavWriter::create(tmp, expected)?;

    for segment in segments {
        let mut reader = WavReader::open(segment)?;
        let spec = reader.spec();
        if spec != expected {
            return Err(DuplexError::SegmentMerge(format!(
                "segment {} format {:?}/{}bit does not match {:?}/{}bit",
                segment.display(),
                spec.sample_format,
                spec.bits_per_sample,
                expected.sample_format,
                expected.bits_per_sample,
            )));
        }
        match expected.sample_format {
            SampleFormat::Int => {
                for sample in reader.samples::<i16>() {
                    writer.write_sample(sample?)?;
                }
            }
            SampleFormat::Float => {
                for sample in reader.samples::<f32>() {
                    writer.write_sample(sample?)?;
                }
            }
        }
    }

    writer.finalize()?;
    Ok(())
}

/// Two-pass offline normalization.
///
/// Pass 1 measures per-channel integrated RMS and peak; pass 2 applies
/// `min(needed, headroom)` gain, a hard ceiling clamp, and the tanh soft
/// clip, then atomically replaces the original file.
pub(crate) fn normalize_file(path: &Path, target_rms_dbfs: f32, ceiling_dbfs: f32) -> Result<()> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 2 {
        return Err(DuplexError::SegmentMerge(format!(
            "normalization expects a stereo file, got {} channels",
            spec.channels
        )));
    }

    let interleaved: Vec<f32> = read_f32(&mut reader, spec)?;
    let ceiling = f64::from(db_to_linear(ceiling_dbfs));

    // Pass 1: per-channel integrated RMS and peak.
    let mut gains = [1.0f64; 2];
    for channel in 0..2 {
        let mut sum_sq = 0f64;
        let mut peak = 0f64;
        let mut count = 0u64;
        for &sample in interleaved.iter().skip(channel).step_by(2) {
            let v = f64::from(sample);
            sum_sq += v * v;
            peak = peak.max(v.abs());
            count += 1;
        }
        if count == 0 || peak <= 0.0 {
            continue;
        }
        let rms = (sum_sq / count as f64).sqrt();
        let needed_db = (f64::from(target_rms_dbfs) - 20.0 * rms.log10()).max(0.0);
        let needed = 10f64.powf(needed_db / 20.0);
        let headroom = ceiling / peak;
        gains[channel] = needed.min(headroom);
    }

    debug!(
        near_gain = format_args!("{:.3}", gains[0]),
        far_gain = format_args!("{:.3}", gains[1]),
        "offline normalization gains"
    );

    // Pass 2: apply gain, ceiling, soft clip; replace atomically.
    let knee = SOFT_CLIP_DRIVE.tanh();
    let tmp = path.with_extension("norm.tmp");
    let result = (|| -> Result<()> {
        let mut writer = WavWriter::create(&tmp, spec)?;
        for (i, &sample) in interleaved.iter().enumerate() {
            let gained = f64::from(sample) * gains[i % 2];
            let clamped = gained.clamp(-ceiling, ceiling);
            let shaped = ((SOFT_CLIP_DRIVE * clamped).tanh() / knee) as f32;
            match spec.sample_format {
                SampleFormat::Float => writer.write_sample(shaped)?,
                SampleFormat::Int => {
                    writer.write_sample((shaped.clamp(-1.0, 1.0) * 32_767.0).round() as i16)?
                }
            }
        }
        writer.finalize()?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_f32(
    reader: &mut WavReader<std::io::BufReader<std::fs::File>>,
    spec: WavSpec,
) -> Result<Vec<f32>> {
    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32_768.0))
            .collect::<std::result::Result<Vec<_>, _>>()?,
        (format, bits) => {
            return Err(DuplexError::SegmentMerge(format!(
                "unsupported layout for normalization: {format:?} at {bits} bits"
            )))
        }
    };
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BitDepth;
    use crate::writer::sink::stereo_spec;
    use std::f32::consts::PI;

    fn write_stereo_i16(path: &Path, frames: &[(i16, i16)]) {
        let mut writer =
            WavWriter::create(path, stereo_spec(48_000, BitDepth::Pcm16)).expect("create");
        for &(l, r) in frames {
            writer.write_sample(l).unwrap();
            writer.write_sample(r).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn read_stereo_i16(path: &Path) -> Vec<i16> {
        let mut reader = WavReader::open(path).expect("open");
        reader.samples::<i16>().map(|s| s.unwrap()).collect()
    }

    #[test]
    fn merge_concatenates_in_segment_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        let c = dir.path().join("c.wav");
        write_stereo_i16(&a, &[(1, -1), (2, -2)]);
        write_stereo_i16(&b, &[(3, -3)]);
        write_stereo_i16(&c, &[(4, -4), (5, -5)]);

        merge_segments(&[a.clone(), b.clone(), c.clone()]).expect("merge");

        assert_eq!(
            read_stereo_i16(&a),
            vec![1, -1, 2, -2, 3, -3, 4, -4, 5, -5]
        );
        assert!(!b.exists());
        assert!(!c.exists());
        assert!(!a.with_extension("merge.tmp").exists());
    }

    #[test]
    fn merge_rejects_mismatched_formats_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_stereo_i16(&a, &[(1, 1)]);
        let mut writer =
            WavWriter::create(&b, stereo_spec(48_000, BitDepth::Float32)).expect("create");
        writer.write_sample(0.5f32).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        let err = merge_segments(&[a.clone(), b.clone()]).unwrap_err();
        assert!(matches!(err, DuplexError::SegmentMerge(_)));
        // Nothing was replaced or deleted.
        assert_eq!(read_stereo_i16(&a), vec![1, 1]);
        assert!(b.exists());
        assert!(!a.with_extension("merge.tmp").exists());
    }

    #[test]
    fn normalization_boosts_quiet_channels_up_to_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.wav");
        let spec = stereo_spec(48_000, BitDepth::Float32);
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for n in 0..48_000 {
            let s = 0.01 * (2.0 * PI * 440.0 * n as f32 / 48_000.0).sin();
            writer.write_sample(s).unwrap();
            writer.write_sample(s * 0.5).unwrap();
        }
        writer.finalize().unwrap();

        normalize_file(&path, -20.0, -1.0).expect("normalize");

        let report = crate::diag::analysis::analyze_file(&path).expect("analysis");
        assert!(
            report.left.rms_dbfs > -24.0,
            "left not boosted: {}",
            report.left.rms_dbfs
        );
        assert!(report.left.peak_dbfs <= 0.01);
        assert!(report.right.rms_dbfs > -27.0);
    }

    #[test]
    fn normalization_never_exceeds_full_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hot.wav");
        let spec = stereo_spec(48_000, BitDepth::Float32);
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for n in 0..4_800 {
            let s = 0.99 * (2.0 * PI * 440.0 * n as f32 / 48_000.0).sin();
            writer.write_sample(s).unwrap();
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        normalize_file(&path, -20.0, -1.0).expect("normalize");

        let mut reader = WavReader::open(&path).unwrap();
        for sample in reader.samples::<f32>() {
            let v = sample.unwrap();
            assert!(v.abs() <= 1.0, "sample {v} out of range");
        }
    }
}
