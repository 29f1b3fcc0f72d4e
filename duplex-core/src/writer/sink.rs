//! Sample sinks: the boundary the writer thread writes through.
//!
//! Production sinks wrap `hound::WavWriter`; tests substitute failing sinks
//! to drive the rotation-recovery path deterministically.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::config::BitDepth;

/// One interleaved stereo frame, already quantized for the output format.
#[derive(Debug, Clone)]
pub enum EncodedFrame {
    Pcm16(Vec<i16>),
    Float32(Vec<f32>),
}

impl EncodedFrame {
    pub fn samples(&self) -> usize {
        match self {
            EncodedFrame::Pcm16(data) => data.len(),
            EncodedFrame::Float32(data) => data.len(),
        }
    }
}

/// Append-only sample sink owned by the writer thread.
pub trait SampleSink: Send {
    fn write_frame(&mut self, frame: &EncodedFrame) -> hound::Result<()>;
    /// Push samples and header state to disk.
    fn flush(&mut self) -> hound::Result<()>;
    /// Write final length fields and close.
    fn finalize(self: Box<Self>) -> hound::Result<()>;
}

/// Factory the writer uses to (re-)open sinks, including recovery segments.
pub type SinkFactory = Box<dyn Fn(&Path) -> hound::Result<Box<dyn SampleSink>> + Send>;

/// Canonical stereo output spec for the session format.
pub fn stereo_spec(sample_rate: u32, depth: BitDepth) -> WavSpec {
    match depth {
        BitDepth::Pcm16 => WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
        BitDepth::Float32 => WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    }
}

pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
}

impl WavSink {
    pub fn create(path: &Path, spec: WavSpec) -> hound::Result<Self> {
        Ok(Self {
            writer: WavWriter::create(path, spec)?,
        })
    }

    /// Factory producing `WavSink`s with a fixed spec.
    pub fn factory(spec: WavSpec) -> SinkFactory {
        Box::new(move |path| {
            WavSink::create(path, spec).map(|sink| Box::new(sink) as Box<dyn SampleSink>)
        })
    }
}

impl SampleSink for WavSink {
    fn write_frame(&mut self, frame: &EncodedFrame) -> hound::Result<()> {
        match frame {
            EncodedFrame::Pcm16(data) => {
                for &sample in data {
                    self.writer.write_sample(sample)?;
                }
            }
            EncodedFrame::Float32(data) => {
                for &sample in data {
                    self.writer.write_sample(sample)?;
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> hound::Result<()> {
        self.writer.flush()
    }

    fn finalize(self: Box<Self>) -> hound::Result<()> {
        self.writer.finalize()
    }
}
