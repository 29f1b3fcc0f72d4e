use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by duplex-core.
///
/// Ordinary I/O trouble during a recording never surfaces here — the writer
/// recovers into a new segment on its own. The public API only returns an
/// error when a session cannot be created at all or when finalization hits a
/// condition that must not be papered over (mismatched segment formats).
#[derive(Debug, Error)]
pub enum DuplexError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot create recording sink at {path}: {source}")]
    SinkCreate {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("segment merge failed: {0}")]
    SegmentMerge(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DuplexError>;
