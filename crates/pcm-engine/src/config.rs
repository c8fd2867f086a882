//! Scalar knobs for one transfer invocation.

use std::time::Duration;

use crate::error::{EngineError, Result};

/// Limit on how much data a playback/capture run moves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferLimit {
    /// Run until the source ends (playback) or forever (capture).
    #[default]
    None,
    /// Stop after this many seconds of audio.
    Seconds(u64),
    /// Stop after this many samples per channel.
    Samples(u64),
}

/// Optional device position validation around each I/O call.
#[derive(Clone, Copy, Debug)]
pub struct PositionCheck {
    /// Readings beyond `coef * buffer_frames / 2` are reported as suspicious.
    pub coef: i64,
}

impl Default for PositionCheck {
    fn default() -> Self {
        Self { coef: 8 }
    }
}

/// Configuration for the chunked transfer engine.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Frames moved per chunk. Must be smaller than `buffer_frames`.
    pub chunk_frames: usize,
    /// Negotiated device buffer size in frames.
    pub buffer_frames: usize,
    /// Busy-poll instead of waiting for device readiness on short writes.
    pub no_wait: bool,
    /// Treat xruns as fatal instead of repreparing.
    pub fatal_xruns: bool,
    /// Bounded wait for device readiness after a short/would-block result.
    pub ready_timeout: Duration,
    /// Delay between resume attempts while the device reports "try again".
    pub resume_retry_delay: Duration,
    /// When set, validate device avail/delay readings each iteration.
    pub position_check: Option<PositionCheck>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            buffer_frames: 4096,
            no_wait: false,
            fatal_xruns: false,
            ready_timeout: Duration::from_millis(100),
            resume_retry_delay: Duration::from_secs(1),
            position_check: None,
        }
    }
}

impl TransferConfig {
    /// Reject geometry the transfer loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_frames == 0 {
            return Err(EngineError::Config("chunk size must be non-zero".into()));
        }
        if self.chunk_frames >= self.buffer_frames {
            return Err(EngineError::Config(format!(
                "can't use period equal to buffer size ({} >= {})",
                self.chunk_frames, self.buffer_frames
            )));
        }
        Ok(())
    }
}
