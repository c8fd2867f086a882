//! rawpipe — plays and records raw PCM audio.
//!
//! Streams raw sample data between files/stdio and an audio device in
//! fixed-size chunks, riding out device glitches, with optional VU
//! metering, channel remapping and capture-file rotation. The transfer
//! logic lives in the `pcm-engine` crate; this binary supplies argument
//! parsing, signal wiring and a CPAL-backed device session.

mod cli;
mod queue;
mod runtime;
mod session;
mod vu;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rawpipe=info")),
        )
        // Captured audio goes to stdout; keep all diagnostics on stderr.
        .with_writer(std::io::stderr)
        .init();
    runtime::run(args)
}
