//! Run orchestration.
//!
//! Wires CLI scalars into the engine, opens sources/sinks and the device
//! session, and drives the playback/capture loops.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use pcm_engine::chmap::{ChannelMap, ChannelPosition, parse_channel_order};
use pcm_engine::config::{PositionCheck, TransferConfig, TransferLimit};
use pcm_engine::format::StreamFormat;
use pcm_engine::meter::{MeterLevels, MeterMode};
use pcm_engine::pipeline::{
    self, CaptureSink, ChannelSink, ChannelSource, RunOptions, TransferStatus,
};
use pcm_engine::rotate::{CaptureFileSet, RotationPolicy};
use pcm_engine::session::Direction;
use pcm_engine::signal::SignalFlags;
use pcm_engine::transfer::TransferEngine;

use crate::cli::{self, Args, Command, MeterKind};
use crate::session::CpalSession;
use crate::vu;

pub fn run(args: Args) -> Result<ExitCode> {
    let (coding, channels, rate) = cli::resolve_stream_params(&args)?;
    let format = StreamFormat::new(coding, channels, rate)?;

    let signals = SignalFlags::shared();
    install_abort_handler(signals.clone(), args.quiet)?;
    let _pid_file = args.pid_file.as_deref().map(PidFile::create).transpose()?;

    let config = transfer_config(&args);
    let limit = transfer_limit(&args);

    match &args.cmd {
        Command::Play { files } => {
            let files = files.clone();
            run_play(&args, format, config, signals, limit, files)
        }
        Command::Record { files } => {
            let files = files.clone();
            run_record(&args, format, config, signals, limit, files)
        }
    }
}

fn run_play(
    args: &Args,
    format: StreamFormat,
    config: TransferConfig,
    signals: Arc<SignalFlags>,
    limit: TransferLimit,
    files: Vec<PathBuf>,
) -> Result<ExitCode> {
    let mut engine = build_engine(args, format, config, signals)?;
    let mut session = CpalSession::open_playback(args.device.as_deref(), &format, args.buffer_size)?;
    let metering = engine.meter_levels().is_some() && !args.quiet;
    let mut render = |levels: &MeterLevels| vu::render(levels);

    let mut total_frames = 0u64;
    let mut aborted = false;

    if args.separate_channels {
        if files.is_empty() {
            bail!("separate-channels playback needs input files");
        }
        let names = channel_file_names(&files, format.channels())?;
        banner(
            &format,
            Direction::Playback,
            &names[0].display().to_string(),
            args.quiet,
        );
        let mut sources = Vec::new();
        for name in &names {
            let reader =
                File::open(name).with_context(|| format!("open {}", name.display()))?;
            sources.push(ChannelSource {
                reader,
                name: name.display().to_string(),
            });
        }
        let report = pipeline::run_playback_channels(
            &mut engine,
            &mut session,
            &mut sources,
            limit,
            run_options(metering, &mut render),
        )?;
        total_frames += report.frames;
        aborted = report.status == TransferStatus::Aborted;
    } else {
        let names: Vec<PathBuf> = if files.is_empty() {
            vec![PathBuf::from("-")]
        } else {
            files
        };
        for name in names {
            let report = if name == Path::new("-") {
                banner(&format, Direction::Playback, "stdin", args.quiet);
                let stdin = std::io::stdin();
                let mut lock = stdin.lock();
                pipeline::run_playback(
                    &mut engine,
                    &mut session,
                    &mut lock,
                    "stdin",
                    limit,
                    run_options(metering, &mut render),
                )?
            } else {
                let display = name.display().to_string();
                banner(&format, Direction::Playback, &display, args.quiet);
                let mut file =
                    File::open(&name).with_context(|| format!("open {}", name.display()))?;
                pipeline::run_playback(
                    &mut engine,
                    &mut session,
                    &mut file,
                    &display,
                    limit,
                    run_options(metering, &mut render),
                )?
            };
            total_frames += report.frames;
            if report.status == TransferStatus::Aborted {
                aborted = true;
                break;
            }
        }
    }

    if metering {
        vu::finish();
    }
    tracing::info!(frames = total_frames, aborted, "playback finished");
    Ok(exit_code(aborted))
}

fn run_record(
    args: &Args,
    format: StreamFormat,
    config: TransferConfig,
    signals: Arc<SignalFlags>,
    limit: TransferLimit,
    files: Vec<PathBuf>,
) -> Result<ExitCode> {
    let mut engine = build_engine(args, format, config, signals)?;
    let mut session = CpalSession::open_capture(args.device.as_deref(), &format, args.buffer_size)?;
    let metering = engine.meter_levels().is_some() && !args.quiet;
    let mut render = |levels: &MeterLevels| vu::render(levels);

    let mut total_frames = 0u64;
    let mut aborted = false;
    let mut written: Vec<PathBuf> = Vec::new();

    if args.separate_channels {
        if files.is_empty() {
            bail!("separate-channels capture needs output files");
        }
        let names = channel_file_names(&files, format.channels())?;
        banner(
            &format,
            Direction::Capture,
            &names[0].display().to_string(),
            args.quiet,
        );
        let mut sinks = Vec::new();
        for name in &names {
            let writer =
                File::create(name).with_context(|| format!("create {}", name.display()))?;
            sinks.push(ChannelSink {
                writer,
                name: name.display().to_string(),
            });
        }
        let report = pipeline::run_capture_channels(
            &mut engine,
            &mut session,
            &mut sinks,
            limit,
            run_options(metering, &mut render),
        )?;
        total_frames += report.frames;
        aborted = report.status == TransferStatus::Aborted;
        written = names;
    } else {
        let names: Vec<PathBuf> = if files.is_empty() {
            vec![PathBuf::from("-")]
        } else {
            files
        };
        let policy = RotationPolicy {
            max_file_seconds: args.max_file_time.unwrap_or(0),
            time_template: args.use_strftime,
        };
        for name in names {
            let report = if name == Path::new("-") {
                banner(&format, Direction::Capture, "stdout", args.quiet);
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                pipeline::run_capture(
                    &mut engine,
                    &mut session,
                    CaptureSink::Stream {
                        writer: &mut lock,
                        name: "stdout".into(),
                    },
                    limit,
                    run_options(metering, &mut render),
                )?
            } else {
                banner(
                    &format,
                    Direction::Capture,
                    &name.display().to_string(),
                    args.quiet,
                );
                let set = CaptureFileSet::create(name.clone(), &policy, &format)?;
                pipeline::run_capture(
                    &mut engine,
                    &mut session,
                    CaptureSink::Rotating(set),
                    limit,
                    run_options(metering, &mut render),
                )?
            };
            total_frames += report.frames;
            written.extend(report.files);
            if report.status == TransferStatus::Aborted {
                aborted = true;
                break;
            }
        }
    }

    if metering {
        vu::finish();
    }
    tracing::info!(frames = total_frames, files = ?written, aborted, "capture finished");
    Ok(exit_code(aborted))
}

fn build_engine(
    args: &Args,
    format: StreamFormat,
    config: TransferConfig,
    signals: Arc<SignalFlags>,
) -> Result<TransferEngine> {
    let mut engine = TransferEngine::new(format, config, signals)?;
    if let Some(mode) = meter_mode(args, &format) {
        engine = engine.with_meter(mode);
    }
    if let Some(spec) = args.chmap.as_deref() {
        let requested = parse_channel_order(spec)?;
        let device_order = ChannelPosition::default_layout(format.channels()).with_context(
            || format!("no known channel layout for {} channels", format.channels()),
        )?;
        if let Some(map) = ChannelMap::build(&requested, &device_order)? {
            engine = engine.with_channel_map(map)?;
        }
    }
    Ok(engine)
}

fn install_abort_handler(signals: Arc<SignalFlags>, quiet: bool) -> Result<()> {
    ctrlc::set_handler(move || {
        if !quiet {
            eprintln!("Aborted by signal...");
        }
        signals.request_abort();
    })
    .context("install signal handler")
}

fn transfer_config(args: &Args) -> TransferConfig {
    TransferConfig {
        chunk_frames: args.period_size,
        buffer_frames: args.buffer_size,
        no_wait: args.no_wait,
        fatal_xruns: args.fatal_errors,
        position_check: args.check_position.then_some(PositionCheck {
            coef: args.position_coef,
        }),
        ..TransferConfig::default()
    }
}

fn transfer_limit(args: &Args) -> TransferLimit {
    if let Some(secs) = args.duration {
        TransferLimit::Seconds(secs)
    } else if let Some(samples) = args.samples {
        TransferLimit::Samples(samples)
    } else {
        TransferLimit::None
    }
}

/// A stereo meter needs an interleaved two-channel stream; anything else
/// falls back to mono.
fn meter_mode(args: &Args, format: &StreamFormat) -> Option<MeterMode> {
    let kind = args.vumeter?;
    if kind == MeterKind::Stereo && (format.channels() != 2 || args.separate_channels) {
        return Some(MeterMode::Mono);
    }
    Some(match kind {
        MeterKind::Mono => MeterMode::Mono,
        MeterKind::Stereo => MeterMode::Stereo,
    })
}

fn run_options<'a>(
    metering: bool,
    render: &'a mut dyn FnMut(&MeterLevels),
) -> RunOptions<'a> {
    if metering {
        RunOptions {
            on_levels: Some(render),
        }
    } else {
        RunOptions::default()
    }
}

fn banner(format: &StreamFormat, direction: Direction, name: &str, quiet: bool) {
    if quiet {
        return;
    }
    let verb = match direction {
        Direction::Playback => "Playing",
        Direction::Capture => "Recording",
    };
    let channels = match format.channels() {
        1 => "Mono".to_string(),
        2 => "Stereo".to_string(),
        n => format!("Channels {n}"),
    };
    eprintln!(
        "{verb} raw '{name}' : {}, Rate {} Hz, {channels}",
        format.coding().name(),
        format.rate()
    );
}

/// One file per channel: a single name expands to `name.0`, `name.1`, …;
/// otherwise exactly one name per channel is required.
fn channel_file_names(names: &[PathBuf], channels: usize) -> Result<Vec<PathBuf>> {
    if names.len() == 1 && channels > 1 {
        let base = names[0].display().to_string();
        return Ok((0..channels)
            .map(|ch| PathBuf::from(format!("{base}.{ch}")))
            .collect());
    }
    if names.len() == channels {
        return Ok(names.to_vec());
    }
    bail!("you need to specify {channels} files");
}

fn exit_code(aborted: bool) -> ExitCode {
    if aborted {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot create process ID file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use pcm_engine::format::SampleCoding;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn channel_file_names_expands_a_single_name() {
        let names = channel_file_names(&[PathBuf::from("out.raw")], 2).unwrap();
        assert_eq!(
            names,
            vec![PathBuf::from("out.raw.0"), PathBuf::from("out.raw.1")]
        );
    }

    #[test]
    fn channel_file_names_requires_a_name_per_channel() {
        let names = [PathBuf::from("l.raw"), PathBuf::from("r.raw")];
        assert_eq!(channel_file_names(&names, 2).unwrap(), names.to_vec());
        assert!(channel_file_names(&names, 4).is_err());
    }

    #[test]
    fn transfer_limit_prefers_duration() {
        let args = parse(&["rawpipe", "play", "-d", "5"]);
        assert_eq!(transfer_limit(&args), TransferLimit::Seconds(5));
        let args = parse(&["rawpipe", "play", "-s", "500"]);
        assert_eq!(transfer_limit(&args), TransferLimit::Samples(500));
        let args = parse(&["rawpipe", "play"]);
        assert_eq!(transfer_limit(&args), TransferLimit::None);
    }

    #[test]
    fn stereo_meter_downgrades_without_two_interleaved_channels() {
        let format = StreamFormat::new(SampleCoding::S16_LE, 1, 48_000).unwrap();
        let args = parse(&["rawpipe", "play", "-V", "stereo"]);
        assert_eq!(meter_mode(&args, &format), Some(MeterMode::Mono));

        let stereo = StreamFormat::new(SampleCoding::S16_LE, 2, 48_000).unwrap();
        assert_eq!(meter_mode(&args, &stereo), Some(MeterMode::Stereo));

        let args = parse(&["rawpipe", "play", "-V", "stereo", "-I"]);
        assert_eq!(meter_mode(&args, &stereo), Some(MeterMode::Mono));

        let args = parse(&["rawpipe", "play"]);
        assert_eq!(meter_mode(&args, &stereo), None);
    }

    #[test]
    fn transfer_config_carries_the_cli_knobs() {
        let args = parse(&[
            "rawpipe",
            "play",
            "--period-size",
            "512",
            "--buffer-size",
            "2048",
            "--fatal-errors",
            "--no-wait",
            "--check-position",
        ]);
        let config = transfer_config(&args);
        assert_eq!(config.chunk_frames, 512);
        assert_eq!(config.buffer_frames, 2048);
        assert!(config.fatal_xruns);
        assert!(config.no_wait);
        assert!(config.position_check.is_some());
    }
}
