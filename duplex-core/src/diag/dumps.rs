//! Optional per-stream mono dump files.
//!
//! Three 16-bit mono WAVs mirroring what the pipeline saw: the raw near
//! frame, the processed near frame as routed to the writer, and the far
//! reference. Dump failures never disturb the main recording.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::warn;

use crate::error::Result;

type MonoWriter = WavWriter<BufWriter<File>>;

pub struct MonoDumps {
    near_raw: MonoWriter,
    near_processed: MonoWriter,
    far: MonoWriter,
}

impl MonoDumps {
    /// Create the three dump files next to `main_path`.
    pub fn create(main_path: &Path, sample_rate: u32) -> Result<Self> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        Ok(Self {
            near_raw: WavWriter::create(dump_path(main_path, "near_raw"), spec)?,
            near_processed: WavWriter::create(dump_path(main_path, "near_processed"), spec)?,
            far: WavWriter::create(dump_path(main_path, "far"), spec)?,
        })
    }

    /// Mirror one pair into the dump files.
    pub fn write_pair(&mut self, near_raw: &[f32], near_processed: &[f32], far: &[f32]) {
        write_frame(&mut self.near_raw, near_raw);
        write_frame(&mut self.near_processed, near_processed);
        write_frame(&mut self.far, far);
    }

    pub fn finalize(self) {
        for (name, writer) in [
            ("near_raw", self.near_raw),
            ("near_processed", self.near_processed),
            ("far", self.far),
        ] {
            if let Err(e) = writer.finalize() {
                warn!(dump = name, "failed to finalize dump file: {e}");
            }
        }
    }
}

fn dump_path(main_path: &Path, stream: &str) -> PathBuf {
    let stem = main_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_owned());
    main_path.with_file_name(format!("{stem}.{stream}.wav"))
}

fn write_frame(writer: &mut MonoWriter, frame: &[f32]) {
    for &sample in frame {
        let code = (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
        if let Err(e) = writer.write_sample(code) {
            warn!("dump write failed: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_paths_derive_from_main_artifact() {
        let main = Path::new("/tmp/calls/20260801_120000_alice.wav");
        assert_eq!(
            dump_path(main, "near_raw"),
            Path::new("/tmp/calls/20260801_120000_alice.near_raw.wav")
        );
    }

    #[test]
    fn dumps_round_trip_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = dir.path().join("session.wav");
        let mut dumps = MonoDumps::create(&main, 48_000).expect("create dumps");
        let frame: Vec<f32> = (0..480).map(|n| (n as f32 / 480.0) - 0.5).collect();
        dumps.write_pair(&frame, &frame, &frame);
        dumps.finalize();

        for stream in ["near_raw", "near_processed", "far"] {
            let path = dir.path().join(format!("session.{stream}.wav"));
            let mut reader = hound::WavReader::open(&path).expect("open dump");
            assert_eq!(reader.spec().channels, 1);
            assert_eq!(reader.spec().sample_rate, 48_000);
            let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
            assert_eq!(samples.len(), 480);
            assert_eq!(samples[240], ((frame[240] * 32_767.0).round()) as i16);
        }
    }
}
