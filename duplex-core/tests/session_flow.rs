//! End-to-end session scenarios driven through the public API.

use std::f32::consts::PI;
use std::path::Path;

use duplex_core::{
    BitDepth, RecorderSession, SampleEncoding, SessionConfig, SourceFormat,
};
use hound::WavReader;

const RATE: u32 = 48_000;
const FRAME: usize = 480;

fn f32_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn i16_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn sine(amplitude: f32, freq: f32, rate: u32, n0: usize, len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| amplitude * (2.0 * PI * freq * (n0 + n) as f32 / rate as f32).sin())
        .collect()
}

fn mono_f32(rate: u32) -> SourceFormat {
    SourceFormat::new(SampleEncoding::F32, rate, 1)
}

/// Transparent configuration: float output, every optional stage off.
fn transparent_cfg(dir: &Path) -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.recording.output_dir = dir.to_path_buf();
    cfg.recording.bits_per_sample = BitDepth::Float32;
    cfg.limiter.enabled = false;
    cfg.dither.enabled = false;
    cfg.aec.echo_cancellation = false;
    cfg
}

fn read_stereo_f32(path: &Path) -> (Vec<f32>, Vec<f32>) {
    let mut reader = WavReader::open(path).expect("open output");
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    let interleaved: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
    let mut left = Vec::with_capacity(interleaved.len() / 2);
    let mut right = Vec::with_capacity(interleaved.len() / 2);
    for pair in interleaved.chunks_exact(2) {
        left.push(pair[0]);
        right.push(pair[1]);
    }
    (left, right)
}

#[test]
fn transparent_session_round_trips_both_channels_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let session = RecorderSession::create(transparent_cfg(dir.path()), "round trip").unwrap();

    let mic = sine(0.25, 440.0, RATE, 0, RATE as usize);
    let spk = sine(0.4, 1_000.0, RATE, 0, RATE as usize);
    let fmt = mono_f32(RATE);
    for (mic_frame, spk_frame) in mic.chunks(FRAME).zip(spk.chunks(FRAME)) {
        // Loopback data lands first, as the reverse buffer expects.
        session.append_speaker(&f32_bytes(spk_frame), &fmt);
        session.append_mic(&f32_bytes(mic_frame), &fmt);
    }

    let result = session.finalize().unwrap();
    assert_eq!(result.segment_paths.len(), 1);
    assert_eq!(result.final_path, result.segment_paths[0]);

    let (left, right) = read_stereo_f32(&result.final_path);
    assert_eq!(left, mic, "left channel must be the mic verbatim");
    assert_eq!(right, spk, "right channel must be the loopback verbatim");

    let spec = WavReader::open(&result.final_path).unwrap().spec();
    assert_eq!(spec.sample_rate, RATE);
    assert_eq!(spec.bits_per_sample, 32);
}

#[test]
fn finalize_then_dispose_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let session = RecorderSession::create(transparent_cfg(dir.path()), "twice").unwrap();
    let fmt = mono_f32(RATE);
    session.append_speaker(&f32_bytes(&sine(0.1, 500.0, RATE, 0, FRAME)), &fmt);
    session.append_mic(&f32_bytes(&sine(0.1, 300.0, RATE, 0, FRAME)), &fmt);

    let first = session.finalize().unwrap();
    let second = session.finalize().unwrap();
    assert_eq!(first.final_path, second.final_path);
    assert_eq!(first.segment_paths, second.segment_paths);
    assert_eq!(
        first.diagnostics.frames_processed,
        second.diagnostics.frames_processed
    );
    session.dispose();
    session.dispose();

    // Appends after finalize change nothing.
    session.append_mic(&f32_bytes(&sine(0.1, 300.0, RATE, 0, FRAME)), &fmt);
    let third = session.finalize().unwrap();
    assert_eq!(third.diagnostics.frames_processed, first.diagnostics.frames_processed);
}

#[test]
fn empty_appends_are_no_ops() {
    let dir = tempfile::tempdir().unwrap();
    let session = RecorderSession::create(transparent_cfg(dir.path()), "empty").unwrap();
    let fmt = mono_f32(RATE);
    session.append_mic(&[], &fmt);
    session.append_speaker(&[], &fmt);
    let result = session.finalize().unwrap();
    assert_eq!(result.diagnostics.frames_processed, 0);
    let (left, right) = read_stereo_f32(&result.final_path);
    assert!(left.is_empty());
    assert!(right.is_empty());
}

/// Mixed capture formats: PCM16 mono mic at 16 kHz against float stereo
/// loopback at 44.1 kHz, both coerced to the 48 kHz pipeline.
#[test]
fn mixed_source_formats_are_coerced_to_the_pipeline_rate() {
    let dir = tempfile::tempdir().unwrap();
    let session = RecorderSession::create(transparent_cfg(dir.path()), "formats").unwrap();

    let mic_fmt = SourceFormat::new(SampleEncoding::I16, 16_000, 1);
    let spk_fmt = SourceFormat::new(SampleEncoding::F32, 44_100, 2);

    for block in 0..100 {
        // 10 ms of stereo float at 44.1 kHz.
        let spk_mono = sine(0.4, 700.0, 44_100, block * 441, 441);
        let mut spk_stereo = Vec::with_capacity(882);
        for s in &spk_mono {
            spk_stereo.push(*s);
            spk_stereo.push(*s);
        }
        session.append_speaker(&f32_bytes(&spk_stereo), &spk_fmt);

        // 10 ms of PCM16 at 16 kHz.
        let mic: Vec<i16> = sine(0.3, 350.0, 16_000, block * 160, 160)
            .iter()
            .map(|s| (s * 32_767.0) as i16)
            .collect();
        session.append_mic(&i16_bytes(&mic), &mic_fmt);
    }

    let result = session.finalize().unwrap();
    let spec = WavReader::open(&result.final_path).unwrap().spec();
    assert_eq!(spec.sample_rate, 48_000);

    let (left, right) = read_stereo_f32(&result.final_path);
    // One second in, one second out, within a frame.
    assert!((left.len() as i64 - 48_000).unsigned_abs() <= FRAME as u64);
    assert_eq!(left.len(), right.len());
    // Both channels actually carry signal.
    let rms = |s: &[f32]| (s.iter().map(|x| x * x).sum::<f32>() / s.len() as f32).sqrt();
    assert!(rms(&left) > 0.1);
    assert!(rms(&right) > 0.2);
}

/// Mic-only input stalls after the allowed lead; finalize pads and flushes.
#[test]
fn near_only_session_stalls_then_finalize_pads() {
    let dir = tempfile::tempdir().unwrap();
    let session = RecorderSession::create(transparent_cfg(dir.path()), "pacing").unwrap();
    let fmt = mono_f32(RATE);

    let mic = sine(0.2, 440.0, RATE, 0, RATE as usize);
    for frame in mic.chunks(FRAME) {
        session.append_mic(&f32_bytes(frame), &fmt);
    }

    let result = session.finalize().unwrap();
    // Only the allowed lead was fabricated live; the rest drained at
    // finalize against zero padding.
    assert_eq!(result.diagnostics.reverse_underruns, 2);
    assert_eq!(result.diagnostics.frames_processed, 100);

    let (left, right) = read_stereo_f32(&result.final_path);
    assert_eq!(left.len(), RATE as usize);
    assert_eq!(left, mic);
    assert!(right.iter().all(|&s| s == 0.0));
}

/// Hot mic with the limiter engaged: peaks bounded, clip census counted.
#[test]
fn limiter_bounds_hot_input_and_counts_clip_hits() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = transparent_cfg(dir.path());
    cfg.limiter.enabled = true;
    cfg.limiter.ceiling_dbfs = -1.0;
    let session = RecorderSession::create(cfg, "clipping").unwrap();
    let fmt = mono_f32(RATE);

    let mic = sine(1.8, 500.0, RATE, 0, RATE as usize);
    let spk = sine(0.1, 900.0, RATE, 0, RATE as usize);
    for (mic_frame, spk_frame) in mic.chunks(FRAME).zip(spk.chunks(FRAME)) {
        session.append_speaker(&f32_bytes(spk_frame), &fmt);
        session.append_mic(&f32_bytes(mic_frame), &fmt);
    }

    let result = session.finalize().unwrap();
    assert!(result.diagnostics.clip_hits_near > 0);
    assert_eq!(result.diagnostics.clip_hits_far, 0);

    let ceiling = 10f32.powf(-1.0 / 20.0);
    let (left, _) = read_stereo_f32(&result.final_path);
    for sample in left {
        assert!(sample.abs() <= ceiling + 1e-6, "sample {sample} over ceiling");
    }
}

/// Sidetone at startup: the session records the probe window, then refuses.
#[test]
fn sidetone_startup_blocks_recording_after_probe_window() {
    let dir = tempfile::tempdir().unwrap();
    let session = RecorderSession::create(transparent_cfg(dir.path()), "sidetone").unwrap();
    let fmt = mono_f32(RATE);

    // 5 s of digitally dead mic against an active far tone.
    for block in 0..500 {
        let far = sine(0.5, 440.0, RATE, block * FRAME, FRAME);
        session.append_speaker(&f32_bytes(&far), &fmt);
        session.append_mic(&f32_bytes(&vec![0.0; FRAME]), &fmt);
    }

    let result = session.finalize().unwrap();
    // All pairs ran through the pipeline, but writes stopped at the block.
    assert_eq!(result.diagnostics.frames_processed, 500);
    let (left, _) = read_stereo_f32(&result.final_path);
    let written_frames = left.len() / FRAME;
    assert!(
        written_frames < 400,
        "writes must stop at the startup verdict, got {written_frames} frames"
    );
    assert!(
        written_frames >= 399,
        "the probe window itself is recorded, got {written_frames} frames"
    );
}

/// Identity processing of a far-corrupted mic fails the tone check with the
/// most fundamental diagnosis.
#[test]
fn tone_check_diagnoses_missing_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = transparent_cfg(dir.path());
    cfg.diagnostics.test_tone_check = true;
    let session = RecorderSession::create(cfg, "tone fail").unwrap();
    let fmt = mono_f32(RATE);

    for block in 0..300 {
        let far = sine(0.5, 1_000.0, RATE, block * FRAME, FRAME);
        let near: Vec<f32> = far.iter().map(|x| x * 0.2).collect();
        session.append_speaker(&f32_bytes(&far), &fmt);
        session.append_mic(&f32_bytes(&near), &fmt);
    }

    let result = session.finalize().unwrap();
    let tone = result.tone_check.expect("tone check requested");
    assert!(!tone.pass);
    assert_eq!(
        tone.diagnosis.as_deref(),
        Some("reverse-before-process ordering")
    );
}

#[test]
fn mono_dumps_mirror_the_main_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = transparent_cfg(dir.path());
    cfg.diagnostics.enable_mono_dumps = true;
    let session = RecorderSession::create(cfg, "dumps").unwrap();
    let fmt = mono_f32(RATE);

    for block in 0..50 {
        session.append_speaker(&f32_bytes(&sine(0.4, 800.0, RATE, block * FRAME, FRAME)), &fmt);
        session.append_mic(&f32_bytes(&sine(0.3, 200.0, RATE, block * FRAME, FRAME)), &fmt);
    }
    let result = session.finalize().unwrap();

    let stem = result
        .final_path
        .file_stem()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    for stream in ["near_raw", "near_processed", "far"] {
        let dump = result
            .final_path
            .with_file_name(format!("{stem}.{stream}.wav"));
        let mut reader = WavReader::open(&dump).expect("dump exists");
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, RATE);
        assert_eq!(reader.samples::<i16>().count(), 50 * FRAME);
    }
}

#[test]
fn output_path_follows_the_calls_date_tree() {
    let dir = tempfile::tempdir().unwrap();
    let session =
        RecorderSession::create(transparent_cfg(dir.path()), "Weekly Sync: Q3").unwrap();
    let result = session.finalize().unwrap();

    let relative = result.final_path.strip_prefix(dir.path()).unwrap();
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    assert_eq!(parts[0], "Calls");
    assert_eq!(parts.len(), 5, "Calls/YYYY/MM/DD/file.wav, got {parts:?}");
    let file = &parts[4];
    assert!(
        file.ends_with("_weekly-sync-q3.wav"),
        "sanitized label expected, got {file}"
    );
}

#[test]
fn unsupported_pipeline_rate_is_coerced_to_48k() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = transparent_cfg(dir.path());
    cfg.recording.sample_rate = 32_000;
    let session = RecorderSession::create(cfg, "coerce").unwrap();
    let result = session.finalize().unwrap();
    let spec = WavReader::open(&result.final_path).unwrap().spec();
    assert_eq!(spec.sample_rate, 48_000);
}

#[test]
fn pcm16_output_stays_within_sample_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = transparent_cfg(dir.path());
    cfg.recording.bits_per_sample = BitDepth::Pcm16;
    cfg.dither.enabled = true;
    cfg.limiter.enabled = true;
    let session = RecorderSession::create(cfg, "pcm16").unwrap();
    let fmt = mono_f32(RATE);

    for block in 0..100 {
        session.append_speaker(&f32_bytes(&sine(1.5, 600.0, RATE, block * FRAME, FRAME)), &fmt);
        session.append_mic(&f32_bytes(&sine(1.5, 250.0, RATE, block * FRAME, FRAME)), &fmt);
    }
    let result = session.finalize().unwrap();

    let mut reader = WavReader::open(&result.final_path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.bits_per_sample, 16);
    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 100 * FRAME * 2);
    // i16 bounds are inherent; check the quantizer never hits full scale
    // thanks to the -1 dBFS ceiling.
    let max = samples.iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert!(max < 32_000, "ceiling should keep codes below full scale, max={max}");
}
