//! # duplex-core
//!
//! Echo-free stereo call recording pipeline.
//!
//! ## Architecture
//!
//! ```text
//! append_mic ──► FormatNormalize ─┐
//!                                 ├─► FrameAligner ─► LeakageGuard ─► AEC
//! append_speaker ─► FormatNormalize ┘                                  │
//!                                                       ChannelChain ◄─┘
//!                                                             │
//!                                            Dither/Quantize + interleave
//!                                                             │
//!                                      bounded queue ─► DurableWriter thread ─► WAV
//! ```
//!
//! The left channel of the artifact carries the microphone after echo
//! cancellation, the right channel carries the far-end loopback. Producers
//! run the whole per-pair chain cooperatively under one session mutex; only
//! the durable writer has its own thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod aec;
pub mod aligner;
pub mod audio;
pub mod config;
pub mod diag;
pub mod dsp;
pub mod error;
pub mod guard;
pub mod session;
pub mod writer;

// Convenience re-exports for downstream crates
pub use audio::{SampleEncoding, SourceFormat};
pub use config::{BitDepth, DitherKind, SessionConfig, SuppressionLevel};
pub use diag::{DiagnosticsSnapshot, ToneCheck};
pub use error::{DuplexError, Result};
pub use session::{FinalizeResult, RecorderSession};
