//! Native echo processor backed by `webrtc-audio-processing`.
//!
//! The native library is strict about framing: mono render/capture streams
//! in 10 ms frames at 48 kHz. Sessions configured differently fall back to
//! the adaptive arm via `select()`.

use anyhow::{anyhow, Result};
use webrtc_audio_processing::{
    Config as ProcessorConfig, EchoCancellation, EchoCancellationSuppressionLevel,
    InitializationConfig, Processor, NUM_SAMPLES_PER_FRAME,
};

use crate::aec::{AecKind, EchoCanceller, MAX_STREAM_DELAY_MS};
use crate::config::{AecConfig, SuppressionLevel};

pub struct NativeAec {
    processor: Processor,
    config: ProcessorConfig,
    stream_delay_ms: u16,
}

impl NativeAec {
    pub fn new(cfg: &AecConfig, sample_rate: u32, frame_len: usize) -> Result<Self> {
        if sample_rate != 48_000 || frame_len != NUM_SAMPLES_PER_FRAME as usize {
            return Err(anyhow!(
                "native processor needs 10 ms frames at 48 kHz, got {frame_len} samples at {sample_rate} Hz"
            ));
        }

        let mut processor = Processor::new(&InitializationConfig {
            num_capture_channels: 1,
            num_render_channels: 1,
            ..InitializationConfig::default()
        })
        .map_err(|e| anyhow!("processor init failed: {e}"))?;

        let config = ProcessorConfig {
            echo_cancellation: Some(EchoCancellation {
                suppression_level: match cfg.suppression_level {
                    SuppressionLevel::Low => EchoCancellationSuppressionLevel::Low,
                    SuppressionLevel::Moderate => EchoCancellationSuppressionLevel::Moderate,
                    SuppressionLevel::High | SuppressionLevel::VeryHigh => {
                        EchoCancellationSuppressionLevel::High
                    }
                },
                stream_delay_ms: Some(i32::from(cfg.initial_delay_ms.min(MAX_STREAM_DELAY_MS))),
                enable_delay_agnostic: true,
                enable_extended_filter: true,
            }),
            ..ProcessorConfig::default()
        };
        processor.set_config(config.clone());

        Ok(Self {
            processor,
            config,
            stream_delay_ms: cfg.initial_delay_ms.min(MAX_STREAM_DELAY_MS),
        })
    }
}

impl EchoCanceller for NativeAec {
    fn feed_far(&mut self, frame: &[f32]) {
        let mut render = frame.to_vec();
        if let Err(e) = self.processor.process_render_frame(&mut render) {
            tracing::warn!("render frame rejected: {e}");
        }
    }

    fn process_near(&mut self, input: &[f32], output: &mut [f32]) {
        output.copy_from_slice(input);
        if let Err(e) = self.processor.process_capture_frame(output) {
            // Contract: on a call-order violation the input passes through.
            tracing::warn!("capture frame rejected: {e}");
            output.copy_from_slice(input);
        }
    }

    fn set_stream_delay_ms(&mut self, delay_ms: u16) {
        let clamped = delay_ms.min(MAX_STREAM_DELAY_MS);
        if clamped == self.stream_delay_ms {
            return;
        }
        self.stream_delay_ms = clamped;
        if let Some(ref mut echo) = self.config.echo_cancellation {
            echo.stream_delay_ms = Some(i32::from(clamped));
        }
        self.processor.set_config(self.config.clone());
    }

    fn kind(&self) -> AecKind {
        AecKind::Native
    }
}
