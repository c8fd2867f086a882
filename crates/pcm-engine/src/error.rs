//! Terminal error taxonomy for the transfer engine.
//!
//! Transient conditions (would-block, xrun, suspend) are resolved inside the
//! recovery path and never appear here.

use std::path::Path;

use thiserror::Error;

/// Failures that end a transfer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected before any transfer begins; never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecognized device result, or a recovery action that could not
    /// restore the stream.
    #[error("device error: {0}")]
    Device(String),

    /// A non-interleaved device call reported divergent per-channel progress.
    #[error("channel transfer lengths diverged")]
    ChannelMismatch,

    /// Source or sink I/O failed outside the device.
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
