//! Playback and capture run loops.
//!
//! These own the chunk cadence: read/write the source or sink, hand chunks
//! to the transfer engine, honor the byte budget, drive rotation for named
//! capture files, and report how the run ended.

use std::io::{Read, Write};
use std::path::PathBuf;

use crate::config::TransferLimit;
use crate::error::{EngineError, Result};
use crate::format::StreamFormat;
use crate::meter::MeterLevels;
use crate::rotate::CaptureFileSet;
use crate::session::DeviceSession;
use crate::signal::SignalFlags;
use crate::transfer::TransferEngine;

/// How a run ended. Fatal conditions are errors, not statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Aborted,
}

/// Result of one playback/capture run.
#[derive(Debug)]
pub struct TransferReport {
    /// Total frames moved through the device (including silence padding).
    pub frames: u64,
    pub status: TransferStatus,
    /// Capture files written, in order, with their final names.
    pub files: Vec<PathBuf>,
}

/// Per-run hooks.
#[derive(Default)]
pub struct RunOptions<'a> {
    /// Called after each chunk with the current meter levels, when metering
    /// is enabled.
    pub on_levels: Option<&'a mut dyn FnMut(&MeterLevels)>,
}

/// Destination of an interleaved capture run.
pub enum CaptureSink<'a> {
    /// Plain byte sink (stdout, a pipe); never rotated.
    Stream {
        writer: &'a mut dyn Write,
        name: String,
    },
    /// Named file sequence with rotation.
    Rotating(CaptureFileSet),
}

/// One per-channel source of a non-interleaved playback run.
pub struct ChannelSource<R> {
    pub reader: R,
    pub name: String,
}

/// One per-channel sink of a non-interleaved capture run.
pub struct ChannelSink<W> {
    pub writer: W,
    pub name: String,
}

/// Total byte budget for a run.
pub fn byte_budget(format: &StreamFormat, limit: TransferLimit) -> u64 {
    match limit {
        TransferLimit::None => u64::MAX,
        TransferLimit::Seconds(secs) => secs.saturating_mul(format.byte_rate()),
        TransferLimit::Samples(samples) => {
            samples.saturating_mul(format.frame_bytes() as u64)
        }
    }
}

/// Stream bytes from `source` to the device until the budget is exhausted or
/// the source ends; the final short chunk is silence-padded. Already-queued
/// audio is drained unless the run was aborted.
pub fn run_playback<S: DeviceSession + ?Sized, R: Read + ?Sized>(
    engine: &mut TransferEngine,
    session: &mut S,
    source: &mut R,
    source_name: &str,
    limit: TransferLimit,
    mut opts: RunOptions<'_>,
) -> Result<TransferReport> {
    let budget = byte_budget(engine.format(), limit);
    let chunk_bytes = engine.chunk_bytes();
    let chunk_frames = engine.chunk_frames();
    let frame_bytes = engine.format().frame_bytes();

    let mut buf = vec![0u8; chunk_bytes];
    let mut consumed: u64 = 0;
    let mut frames_total: u64 = 0;

    loop {
        if engine.signals().aborting() || consumed >= budget {
            break;
        }
        let want = chunk_bytes.min((budget - consumed).min(chunk_bytes as u64) as usize);
        let got = safe_read(source, &mut buf[..want], engine.signals()).map_err(|e| {
            EngineError::Io {
                path: source_name.to_string(),
                source: e,
            }
        })?;
        if got == 0 {
            break;
        }
        let frames = got / frame_bytes;
        if frames == 0 {
            break;
        }

        let sent = engine.transfer_out(session, &mut buf, frames)?;
        frames_total += sent as u64;
        if sent < chunk_frames {
            break;
        }
        consumed += (frames * frame_bytes) as u64;
        render_levels(engine, &mut opts);
        if got < want {
            break;
        }
    }

    let status = run_status(engine.signals());
    if status == TransferStatus::Completed {
        session.drain()?;
    }
    Ok(TransferReport {
        frames: frames_total,
        status,
        files: Vec::new(),
    })
}

/// Stream frames from the device into `sink` until the budget is exhausted,
/// rotating named capture files on threshold or external request. No frames
/// are dropped across a rotation.
pub fn run_capture<S: DeviceSession + ?Sized>(
    engine: &mut TransferEngine,
    session: &mut S,
    mut sink: CaptureSink<'_>,
    limit: TransferLimit,
    mut opts: RunOptions<'_>,
) -> Result<TransferReport> {
    let format = *engine.format();
    let mut budget = byte_budget(&format, limit);
    if budget != u64::MAX {
        // Keep capture sizes even.
        budget += budget % 2;
    }
    let chunk_bytes = engine.chunk_bytes();
    let frame_bytes = format.frame_bytes();

    let mut buf = vec![0u8; chunk_bytes];
    let mut rest = budget;
    let mut frames_total: u64 = 0;

    loop {
        if engine.signals().aborting() || rest == 0 {
            break;
        }
        if let CaptureSink::Rotating(set) = &mut sink {
            if set.should_rotate(engine.signals()) {
                set.rotate()?;
            }
        }

        let want_bytes = chunk_bytes.min(rest.min(chunk_bytes as u64) as usize);
        let want_frames = want_bytes / frame_bytes;
        if want_frames == 0 {
            break;
        }

        let got = engine.transfer_in(session, &mut buf, want_frames)?;
        let save = got * frame_bytes;
        match &mut sink {
            CaptureSink::Stream { writer, name } => {
                writer.write_all(&buf[..save]).map_err(|e| EngineError::Io {
                    path: name.clone(),
                    source: e,
                })?;
            }
            CaptureSink::Rotating(set) => set.write(&buf[..save])?,
        }
        frames_total += got as u64;
        rest = rest.saturating_sub(want_bytes as u64);
        render_levels(engine, &mut opts);
        if got < want_frames {
            break;
        }
    }

    let files = match sink {
        CaptureSink::Rotating(set) => set.finish(),
        CaptureSink::Stream { .. } => Vec::new(),
    };
    Ok(TransferReport {
        frames: frames_total,
        status: run_status(engine.signals()),
        files,
    })
}

/// Non-interleaved playback: one file per channel, equal counts per chunk.
///
/// Pre-loading data before the transfer begins is not supported here.
pub fn run_playback_channels<S: DeviceSession + ?Sized, R: Read>(
    engine: &mut TransferEngine,
    session: &mut S,
    sources: &mut [ChannelSource<R>],
    limit: TransferLimit,
    mut opts: RunOptions<'_>,
) -> Result<TransferReport> {
    let format = *engine.format();
    let channels = format.channels();
    if sources.len() != channels {
        return Err(EngineError::Config(format!(
            "you need to specify {channels} files"
        )));
    }
    let sample_bytes = format.coding().bytes_per_sample();
    let chunk_frames = engine.chunk_frames();
    let vsize = chunk_frames * sample_bytes;
    let budget = byte_budget(&format, limit);

    let mut bufs: Vec<Vec<u8>> = vec![vec![0u8; vsize]; channels];
    let mut consumed: u64 = 0;
    let mut frames_total: u64 = 0;

    loop {
        if engine.signals().aborting() || consumed >= budget {
            break;
        }
        let per_channel = (budget - consumed) / channels as u64;
        let mut expected = vsize.min(per_channel.min(vsize as u64) as usize);
        expected -= expected % sample_bytes;
        if expected == 0 {
            break;
        }

        let got = safe_read(&mut sources[0].reader, &mut bufs[0][..expected], engine.signals())
            .map_err(|e| EngineError::Io {
                path: sources[0].name.clone(),
                source: e,
            })?;
        if got == 0 {
            break;
        }
        for ch in 1..channels {
            let other =
                safe_read(&mut sources[ch].reader, &mut bufs[ch][..got], engine.signals())
                    .map_err(|e| EngineError::Io {
                        path: sources[ch].name.clone(),
                        source: e,
                    })?;
            if other != got {
                return Err(EngineError::Io {
                    path: sources[ch].name.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "channel files ended at different lengths",
                    ),
                });
            }
        }

        let frames = got / sample_bytes;
        let sent = engine.transfer_out_channels(session, &mut bufs, frames)?;
        frames_total += sent as u64;
        if sent != frames {
            break;
        }
        consumed += (sent * format.frame_bytes()) as u64;
        render_levels(engine, &mut opts);
    }

    let status = run_status(engine.signals());
    if status == TransferStatus::Completed {
        session.drain()?;
    }
    Ok(TransferReport {
        frames: frames_total,
        status,
        files: Vec::new(),
    })
}

/// Non-interleaved capture: one file per channel.
pub fn run_capture_channels<S: DeviceSession + ?Sized, W: Write>(
    engine: &mut TransferEngine,
    session: &mut S,
    sinks: &mut [ChannelSink<W>],
    limit: TransferLimit,
    mut opts: RunOptions<'_>,
) -> Result<TransferReport> {
    let format = *engine.format();
    let channels = format.channels();
    if sinks.len() != channels {
        return Err(EngineError::Config(format!(
            "you need to specify {channels} files"
        )));
    }
    let sample_bytes = format.coding().bytes_per_sample();
    let frame_bytes = format.frame_bytes();
    let chunk_bytes = engine.chunk_bytes();
    let budget = byte_budget(&format, limit);

    let mut bufs: Vec<Vec<u8>> =
        vec![vec![0u8; engine.chunk_frames() * sample_bytes]; channels];
    let mut rest = budget;
    let mut frames_total: u64 = 0;

    loop {
        if engine.signals().aborting() || rest == 0 {
            break;
        }
        let want_bytes = chunk_bytes.min(rest.min(chunk_bytes as u64) as usize);
        let want_frames = want_bytes / frame_bytes;
        if want_frames == 0 {
            break;
        }

        let got = engine.transfer_in_channels(session, &mut bufs, want_frames)?;
        let save = got * sample_bytes;
        for (ch, sink) in sinks.iter_mut().enumerate() {
            sink.writer
                .write_all(&bufs[ch][..save])
                .map_err(|e| EngineError::Io {
                    path: sink.name.clone(),
                    source: e,
                })?;
        }
        frames_total += got as u64;
        rest = rest.saturating_sub((got * frame_bytes) as u64);
        render_levels(engine, &mut opts);
        if got < want_frames {
            break;
        }
    }

    Ok(TransferReport {
        frames: frames_total,
        status: run_status(engine.signals()),
        files: Vec::new(),
    })
}

fn run_status(signals: &SignalFlags) -> TransferStatus {
    if signals.aborting() {
        TransferStatus::Aborted
    } else {
        TransferStatus::Completed
    }
}

fn render_levels(engine: &TransferEngine, opts: &mut RunOptions<'_>) {
    if let Some(hook) = opts.on_levels.as_mut() {
        if let Some(levels) = engine.meter_levels() {
            hook(&levels);
        }
    }
}

/// Read until the buffer is full, the source ends, or an abort is requested.
///
/// A read error after partial progress reports the progress; the next call
/// surfaces the error.
fn safe_read<R: Read + ?Sized>(
    source: &mut R,
    buf: &mut [u8],
    signals: &SignalFlags,
) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        if signals.aborting() {
            break;
        }
        match source.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) => {
                if done > 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(done)
}
