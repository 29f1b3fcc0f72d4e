//! Acoustic echo cancellation port.
//!
//! The `EchoCanceller` trait is the core's only polymorphic boundary: the
//! session drives whichever arm was selected at start without knowing which
//! one it got. Contract, per logical frame index:
//!
//! 1. `set_stream_delay_ms` with the current estimate (clamped to 0..=200),
//! 2. `feed_far` with the reverse frame,
//! 3. `process_near` with the capture frame.
//!
//! `process_near` fills exactly one output frame and may reference the far
//! frame only through internal state.

pub mod adaptive;

#[cfg(feature = "native-aec")]
pub mod native;

use tracing::info;
#[cfg(feature = "native-aec")]
use tracing::warn;

use crate::config::AecConfig;

use self::adaptive::AdaptiveAec;

/// Upper bound on the stream delay accepted by any arm.
pub const MAX_STREAM_DELAY_MS: u16 = 200;

/// Which processor arm a session ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AecKind {
    Native,
    Adaptive,
    Identity,
}

impl std::fmt::Display for AecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AecKind::Native => write!(f, "native"),
            AecKind::Adaptive => write!(f, "adaptive"),
            AecKind::Identity => write!(f, "identity"),
        }
    }
}

/// Contract for echo cancellation backends.
///
/// Implementors are stateful (filter weights, delay lines); all calls come
/// from under the session mutex, in frame order.
pub trait EchoCanceller: Send {
    /// Supply one reverse (far-end) frame. Must precede `process_near` for
    /// the same frame index.
    fn feed_far(&mut self, frame: &[f32]);

    /// Cancel far-end content from `input`, writing exactly
    /// `input.len()` samples to `output`.
    fn process_near(&mut self, input: &[f32], output: &mut [f32]);

    /// Render-to-capture delay hint in milliseconds; clamped to 0..=200.
    fn set_stream_delay_ms(&mut self, delay_ms: u16);

    fn kind(&self) -> AecKind;
}

/// Pass-through arm used when echo cancellation is disabled.
pub struct IdentityAec;

impl EchoCanceller for IdentityAec {
    fn feed_far(&mut self, _frame: &[f32]) {}

    fn process_near(&mut self, input: &[f32], output: &mut [f32]) {
        output.copy_from_slice(input);
    }

    fn set_stream_delay_ms(&mut self, _delay_ms: u16) {}

    fn kind(&self) -> AecKind {
        AecKind::Identity
    }
}

/// Pick the best available arm for this session.
///
/// Native when compiled in and the framing matches what the native library
/// expects, otherwise the adaptive fallback, otherwise identity.
pub fn select(cfg: &AecConfig, sample_rate: u32, frame_len: usize) -> Box<dyn EchoCanceller> {
    if !cfg.echo_cancellation {
        info!("echo cancellation disabled, using identity processor");
        return Box::new(IdentityAec);
    }

    #[cfg(feature = "native-aec")]
    match native::NativeAec::new(cfg, sample_rate, frame_len) {
        Ok(processor) => {
            info!(sample_rate, frame_len, "using native echo processor");
            return Box::new(processor);
        }
        Err(e) => {
            warn!("native echo processor unavailable ({e}), falling back to adaptive");
        }
    }

    let processor = AdaptiveAec::new(cfg, sample_rate, frame_len);
    info!(
        sample_rate,
        frame_len,
        taps = processor.taps(),
        "using adaptive echo canceller"
    );
    Box::new(processor)
}
