//! Chunked raw-PCM transfer engine.
//!
//! Moves audio between byte sources/sinks and an already-negotiated device
//! session in fixed-size chunks, recovering from device glitches (xrun,
//! suspend), with optional peak metering, channel remapping and capture-file
//! rotation. Single-threaded and fully synchronous; cancellation is polled
//! from a shared flag object at chunk boundaries.

pub mod chmap;
pub mod config;
pub mod error;
pub mod format;
pub mod meter;
pub mod pipeline;
pub mod recovery;
pub mod rotate;
pub mod session;
pub mod signal;
pub mod transfer;
