use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};

use pcm_engine::format::SampleCoding;

#[derive(Parser, Debug)]
#[command(
    name = "rawpipe",
    version,
    about = "Play and record raw PCM audio",
    disable_version_flag = true
)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Print version
    #[arg(long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Select the audio device by substring match
    #[arg(short = 'D', long, global = true)]
    pub device: Option<String>,

    /// Sample format (e.g. S16_LE), or a shortcut: cd, cdr, dat
    #[arg(short = 'f', long, global = true, default_value = "U8")]
    pub format: String,

    /// Channel count
    #[arg(short = 'c', long, global = true)]
    pub channels: Option<usize>,

    /// Frame rate in Hz (values below 1000 are kHz)
    #[arg(short = 'r', long, global = true)]
    pub rate: Option<u32>,

    /// Stop after this many seconds
    #[arg(short = 'd', long, global = true, conflicts_with = "samples")]
    pub duration: Option<u64>,

    /// Stop after this many samples per channel
    #[arg(short = 's', long, global = true)]
    pub samples: Option<u64>,

    /// Chunk size in frames
    #[arg(long, global = true, default_value_t = 1024)]
    pub period_size: usize,

    /// Device buffer size in frames
    #[arg(long, global = true, default_value_t = 4096)]
    pub buffer_size: usize,

    /// Enable the VU meter
    #[arg(short = 'V', long, global = true, value_enum)]
    pub vumeter: Option<MeterKind>,

    /// One file per channel (non-interleaved transfer)
    #[arg(short = 'I', long, global = true)]
    pub separate_channels: bool,

    /// Requested channel order, e.g. FL,FR
    #[arg(short = 'm', long, global = true)]
    pub chmap: Option<String>,

    /// Start another capture file after this many seconds of audio
    #[arg(long, global = true)]
    pub max_file_time: Option<u64>,

    /// Treat the capture file name as a strftime template (%v = file index)
    #[arg(long, global = true)]
    pub use_strftime: bool,

    /// Treat xruns as fatal
    #[arg(long, global = true)]
    pub fatal_errors: bool,

    /// Busy-poll instead of waiting for device readiness
    #[arg(long, global = true)]
    pub no_wait: bool,

    /// Validate device buffer positions each iteration
    #[arg(long, global = true)]
    pub check_position: bool,

    /// Coefficient for the position validation range
    #[arg(long, global = true, default_value_t = 8)]
    pub position_coef: i64,

    /// Write the process ID here
    #[arg(long, global = true)]
    pub pid_file: Option<PathBuf>,

    /// Quiet mode
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play raw audio from files or stdin
    Play {
        /// Input files ("-" or none for stdin)
        files: Vec<PathBuf>,
    },
    /// Record raw audio to a file or stdout
    Record {
        /// Output files ("-" or none for stdout)
        files: Vec<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MeterKind {
    Mono,
    Stereo,
}

/// Resolve the format/channels/rate triple, applying the cd/cdr/dat
/// shortcuts before explicit overrides.
pub fn resolve_stream_params(args: &Args) -> anyhow::Result<(SampleCoding, usize, u32)> {
    let (coding, mut channels, mut rate) = match args.format.to_ascii_lowercase().as_str() {
        "cd" => (SampleCoding::S16_LE, 2, 44_100),
        "cdr" => (SampleCoding::S16_BE, 2, 44_100),
        "dat" => (SampleCoding::S16_LE, 2, 48_000),
        other => (other.parse()?, 1, 8_000),
    };

    if let Some(c) = args.channels {
        if !(1..=256).contains(&c) {
            bail!("value {c} for channels is invalid");
        }
        channels = c;
    }
    if let Some(r) = args.rate {
        rate = if r < 1000 { r * 1000 } else { r };
    }
    Ok((coding, channels, rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_the_lowest_common_format() {
        let args = parse(&["rawpipe", "play"]);
        let (coding, channels, rate) = resolve_stream_params(&args).unwrap();
        assert_eq!(coding, SampleCoding::U8);
        assert_eq!(channels, 1);
        assert_eq!(rate, 8_000);
    }

    #[test]
    fn cd_shortcut_sets_rate_and_channels() {
        let args = parse(&["rawpipe", "play", "-f", "cd"]);
        let (coding, channels, rate) = resolve_stream_params(&args).unwrap();
        assert_eq!(coding, SampleCoding::S16_LE);
        assert_eq!(channels, 2);
        assert_eq!(rate, 44_100);
    }

    #[test]
    fn explicit_flags_override_the_shortcut() {
        let args = parse(&["rawpipe", "play", "-f", "dat", "-c", "4", "-r", "96000"]);
        let (coding, channels, rate) = resolve_stream_params(&args).unwrap();
        assert_eq!(coding, SampleCoding::S16_LE);
        assert_eq!(channels, 4);
        assert_eq!(rate, 96_000);
    }

    #[test]
    fn small_rates_are_kilohertz() {
        let args = parse(&["rawpipe", "record", "-r", "44"]);
        let (_, _, rate) = resolve_stream_params(&args).unwrap();
        assert_eq!(rate, 44_000);
    }

    #[test]
    fn bad_format_and_channel_counts_are_rejected() {
        let args = parse(&["rawpipe", "play", "-f", "F32_LE"]);
        assert!(resolve_stream_params(&args).is_err());

        let args = parse(&["rawpipe", "play", "-c", "0"]);
        assert!(resolve_stream_params(&args).is_err());

        let args = parse(&["rawpipe", "play", "-c", "300"]);
        assert!(resolve_stream_params(&args).is_err());
    }

    #[test]
    fn duration_and_samples_conflict() {
        assert!(Args::try_parse_from(["rawpipe", "record", "-d", "5", "-s", "100"]).is_err());
    }

    #[test]
    fn record_accepts_rotation_flags() {
        let args = parse(&[
            "rawpipe",
            "record",
            "out.raw",
            "--max-file-time",
            "3600",
            "--use-strftime",
        ]);
        assert_eq!(args.max_file_time, Some(3_600));
        assert!(args.use_strftime);
        match args.cmd {
            Command::Record { files } => assert_eq!(files, vec![PathBuf::from("out.raw")]),
            Command::Play { .. } => panic!("expected record"),
        }
    }
}
