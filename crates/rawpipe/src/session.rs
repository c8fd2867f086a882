//! CPAL-backed device session.
//!
//! Bridges the engine's blocking read/write-by-frames contract onto the
//! real-time CPAL callback: a bounded byte ring carries frames across the
//! thread boundary, and glitches observed by the callback (ring empty on
//! playback, ring full on capture) surface as xrun results on the next
//! session call, with the trigger instant kept for duration reporting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use pcm_engine::error::Result as EngineResult;
use pcm_engine::format::{ByteOrder, SampleCoding, StreamFormat};
use pcm_engine::session::{
    DeviceSession, Direction, IoAttempt, ResumeOutcome, SessionState, SessionStatus,
};

use crate::queue::ByteRing;

/// Raw-byte view of a CPAL sample type.
trait RawSample: cpal::SizedSample + Send + 'static {
    fn from_ne_slice(bytes: &[u8]) -> Self;
    fn write_ne_slice(self, out: &mut [u8]);
}

macro_rules! raw_sample {
    ($($t:ty),*) => {$(
        impl RawSample for $t {
            fn from_ne_slice(bytes: &[u8]) -> Self {
                <$t>::from_ne_bytes(bytes.try_into().expect("whole sample"))
            }
            fn write_ne_slice(self, out: &mut [u8]) {
                out[..size_of::<$t>()].copy_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

raw_sample!(u8, i8, i16, u16, i32, u32);

pub struct CpalSession {
    _stream: cpal::Stream,
    ring: Arc<ByteRing>,
    glitches: Receiver<Instant>,
    primed: Arc<AtomicBool>,
    direction: Direction,
    frame_bytes: usize,
    sample_bytes: usize,
    byte_rate: u64,
    pending_glitch: Option<Instant>,
    scratch: Vec<u8>,
}

impl CpalSession {
    pub fn open_playback(
        device_hint: Option<&str>,
        format: &StreamFormat,
        buffer_frames: usize,
    ) -> anyhow::Result<Self> {
        Self::open(Direction::Playback, device_hint, format, buffer_frames)
    }

    pub fn open_capture(
        device_hint: Option<&str>,
        format: &StreamFormat,
        buffer_frames: usize,
    ) -> anyhow::Result<Self> {
        Self::open(Direction::Capture, device_hint, format, buffer_frames)
    }

    fn open(
        direction: Direction,
        device_hint: Option<&str>,
        format: &StreamFormat,
        buffer_frames: usize,
    ) -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = pick_device(&host, direction, device_hint)?;
        tracing::info!(device = %device.description()?, "audio device");

        let sample_format = cpal_sample_format(format.coding())?;
        let config = pick_stream_config(&device, direction, format, sample_format, buffer_frames)?;
        tracing::info!(
            format = format.coding().name(),
            rate_hz = format.rate(),
            channels = format.channels(),
            buffer_frames,
            "device session configured"
        );

        let ring = Arc::new(ByteRing::new(format.frames_to_bytes(buffer_frames)));
        let (tx, rx) = crossbeam_channel::bounded(4);
        let primed = Arc::new(AtomicBool::new(false));

        let frame_bytes = format.frame_bytes();
        let stream = match sample_format {
            cpal::SampleFormat::U8 => {
                build_stream::<u8>(&device, direction, &config, ring.clone(), tx, primed.clone(), frame_bytes)
            }
            cpal::SampleFormat::I8 => {
                build_stream::<i8>(&device, direction, &config, ring.clone(), tx, primed.clone(), frame_bytes)
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, direction, &config, ring.clone(), tx, primed.clone(), frame_bytes)
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, direction, &config, ring.clone(), tx, primed.clone(), frame_bytes)
            }
            cpal::SampleFormat::I32 => {
                build_stream::<i32>(&device, direction, &config, ring.clone(), tx, primed.clone(), frame_bytes)
            }
            cpal::SampleFormat::U32 => {
                build_stream::<u32>(&device, direction, &config, ring.clone(), tx, primed.clone(), frame_bytes)
            }
            other => return Err(anyhow!("unsupported device sample format: {other:?}")),
        }?;
        stream.play()?;

        Ok(Self {
            _stream: stream,
            ring,
            glitches: rx,
            primed,
            direction,
            frame_bytes,
            sample_bytes: format.coding().bytes_per_sample(),
            byte_rate: format.byte_rate(),
            pending_glitch: None,
            scratch: Vec::new(),
        })
    }

    /// Whether the callback reported a glitch since the last prepare.
    fn take_glitch(&mut self) -> bool {
        if let Ok(at) = self.glitches.try_recv() {
            self.pending_glitch = Some(at);
        }
        self.pending_glitch.is_some()
    }
}

impl DeviceSession for CpalSession {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn write_interleaved(&mut self, data: &[u8], frames: usize) -> EngineResult<IoAttempt> {
        if self.take_glitch() {
            return Ok(IoAttempt::Xrun);
        }
        let bytes = frames * self.frame_bytes;
        let pushed = self.ring.push_available(&data[..bytes], self.frame_bytes);
        if pushed == 0 {
            return Ok(IoAttempt::WouldBlock);
        }
        self.primed.store(true, Ordering::Relaxed);
        Ok(IoAttempt::Frames(pushed / self.frame_bytes))
    }

    fn read_interleaved(&mut self, data: &mut [u8], frames: usize) -> EngineResult<IoAttempt> {
        if self.take_glitch() {
            return Ok(IoAttempt::Xrun);
        }
        let bytes = frames * self.frame_bytes;
        let popped = self.ring.pop_available(&mut data[..bytes], self.frame_bytes);
        if popped == 0 {
            return Ok(IoAttempt::WouldBlock);
        }
        Ok(IoAttempt::Frames(popped / self.frame_bytes))
    }

    fn write_channels(&mut self, bufs: &[&[u8]], frames: usize) -> EngineResult<IoAttempt> {
        if self.take_glitch() {
            return Ok(IoAttempt::Xrun);
        }
        let bytes = frames * self.frame_bytes;
        self.scratch.resize(bytes, 0);
        interleave_into(&mut self.scratch, bufs, frames, self.sample_bytes);
        let pushed = self.ring.push_available(&self.scratch[..bytes], self.frame_bytes);
        if pushed == 0 {
            return Ok(IoAttempt::WouldBlock);
        }
        self.primed.store(true, Ordering::Relaxed);
        Ok(IoAttempt::Frames(pushed / self.frame_bytes))
    }

    fn read_channels(&mut self, bufs: &mut [&mut [u8]], frames: usize) -> EngineResult<IoAttempt> {
        if self.take_glitch() {
            return Ok(IoAttempt::Xrun);
        }
        let bytes = frames * self.frame_bytes;
        self.scratch.resize(bytes, 0);
        let popped = self.ring.pop_available(&mut self.scratch[..bytes], self.frame_bytes);
        if popped == 0 {
            return Ok(IoAttempt::WouldBlock);
        }
        let got = popped / self.frame_bytes;
        deinterleave_from(&self.scratch[..popped], bufs, got, self.sample_bytes);
        Ok(IoAttempt::Frames(got))
    }

    fn status(&mut self) -> EngineResult<SessionStatus> {
        let queued = (self.ring.len() / self.frame_bytes) as i64;
        let free = (self.ring.capacity() / self.frame_bytes) as i64 - queued;
        let (state, trigger) = match self.pending_glitch {
            Some(at) => (SessionState::Xrun, Some(at)),
            None => (SessionState::Running, None),
        };
        let (avail, delay) = match self.direction {
            Direction::Playback => (free, queued),
            Direction::Capture => (queued, queued),
        };
        Ok(SessionStatus {
            state,
            trigger,
            avail,
            delay,
        })
    }

    fn prepare(&mut self) -> EngineResult<()> {
        self.pending_glitch = None;
        while self.glitches.try_recv().is_ok() {}
        self.ring.clear();
        self.primed.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn resume(&mut self) -> EngineResult<ResumeOutcome> {
        // The backend has no suspend/resume; recovery falls back to prepare.
        Ok(ResumeOutcome::Failed)
    }

    fn wait_ready(&mut self, timeout: Duration) -> EngineResult<bool> {
        let ready = match self.direction {
            Direction::Playback => self.ring.wait_space(self.frame_bytes, timeout),
            Direction::Capture => self.ring.wait_data(self.frame_bytes, timeout),
        };
        Ok(ready)
    }

    fn drain(&mut self) -> EngineResult<()> {
        if self.direction == Direction::Capture {
            return Ok(());
        }
        let queued = self.ring.len() as u64;
        let wait_ms = queued.saturating_mul(1000) / self.byte_rate.max(1) + 250;
        self.ring.wait_empty(Duration::from_millis(wait_ms));
        // Let the device-side buffer play out.
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }
}

fn pick_device(
    host: &cpal::Host,
    direction: Direction,
    needle: Option<&str>,
) -> anyhow::Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = match direction {
        Direction::Playback => host.output_devices().context("No output devices")?.collect(),
        Direction::Capture => host.input_devices().context("No input devices")?.collect(),
    };

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No device matched: {needle}"));
    }

    match direction {
        Direction::Playback => host.default_output_device(),
        Direction::Capture => host.default_input_device(),
    }
    .ok_or_else(|| anyhow!("No default device"))
}

/// Map a raw stream coding onto the CPAL sample format the callback moves.
///
/// The callback copies sample bit patterns verbatim, so only host-order
/// codings with a matching CPAL integer type are supported; everything else
/// is a configuration error before any transfer begins.
fn cpal_sample_format(coding: SampleCoding) -> anyhow::Result<cpal::SampleFormat> {
    if coding.bytes_per_sample() > 1 {
        let native = if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        };
        if coding.order() != native {
            return Err(anyhow!(
                "{} is not host byte order and is not supported by this backend",
                coding.name()
            ));
        }
    }
    let format = match (coding.bits(), coding.is_signed()) {
        (8, false) => cpal::SampleFormat::U8,
        (8, true) => cpal::SampleFormat::I8,
        (16, true) => cpal::SampleFormat::I16,
        (16, false) => cpal::SampleFormat::U16,
        (32, true) => cpal::SampleFormat::I32,
        (32, false) => cpal::SampleFormat::U32,
        _ => {
            return Err(anyhow!(
                "{} is not supported by this backend",
                coding.name()
            ));
        }
    };
    Ok(format)
}

fn pick_stream_config(
    device: &cpal::Device,
    direction: Direction,
    format: &StreamFormat,
    sample_format: cpal::SampleFormat,
    buffer_frames: usize,
) -> anyhow::Result<cpal::StreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Playback => device.supported_output_configs()?.collect(),
        Direction::Capture => device.supported_input_configs()?.collect(),
    };

    for range in ranges {
        if range.channels() as usize != format.channels() {
            continue;
        }
        if range.sample_format() != sample_format {
            continue;
        }
        if format.rate() < range.min_sample_rate() || format.rate() > range.max_sample_rate() {
            continue;
        }
        let mut config: cpal::StreamConfig = range.with_sample_rate(format.rate()).into();
        config.buffer_size = cpal::BufferSize::Fixed(buffer_frames as u32);
        return Ok(config);
    }

    Err(anyhow!(
        "device does not support {} at {} Hz with {} channels",
        format.coding().name(),
        format.rate(),
        format.channels()
    ))
}

fn build_stream<T: RawSample>(
    device: &cpal::Device,
    direction: Direction,
    config: &cpal::StreamConfig,
    ring: Arc<ByteRing>,
    events: Sender<Instant>,
    primed: Arc<AtomicBool>,
    frame_bytes: usize,
) -> anyhow::Result<cpal::Stream> {
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let bytes_per = size_of::<T>();
    let mut scratch: Vec<u8> = Vec::new();

    let stream = match direction {
        Direction::Playback => device.build_output_stream(
            config,
            move |data: &mut [T], _| {
                let need = data.len() * bytes_per;
                scratch.resize(need, 0);
                let got = ring.pop_available(&mut scratch[..need], frame_bytes);
                let samples = got / bytes_per;
                for (i, slot) in data.iter_mut().take(samples).enumerate() {
                    *slot = T::from_ne_slice(&scratch[i * bytes_per..(i + 1) * bytes_per]);
                }
                if samples < data.len() {
                    for slot in data[samples..].iter_mut() {
                        *slot = <T as cpal::Sample>::EQUILIBRIUM;
                    }
                    // Only an underrun if the writer had primed the ring.
                    if primed.swap(false, Ordering::Relaxed) {
                        let _ = events.try_send(Instant::now());
                    }
                }
            },
            err_fn,
            None,
        )?,
        Direction::Capture => device.build_input_stream(
            config,
            move |data: &[T], _| {
                let need = data.len() * bytes_per;
                scratch.resize(need, 0);
                for (i, sample) in data.iter().enumerate() {
                    sample.write_ne_slice(&mut scratch[i * bytes_per..]);
                }
                let pushed = ring.push_available(&scratch[..need], frame_bytes);
                if pushed < need {
                    // Ring full: captured frames were dropped.
                    let _ = events.try_send(Instant::now());
                }
            },
            err_fn,
            None,
        )?,
    };
    Ok(stream)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

fn interleave_into(dst: &mut [u8], bufs: &[&[u8]], frames: usize, sample_bytes: usize) {
    let channels = bufs.len();
    for frame in 0..frames {
        for (ch, buf) in bufs.iter().enumerate() {
            let from = frame * sample_bytes;
            let to = (frame * channels + ch) * sample_bytes;
            dst[to..to + sample_bytes].copy_from_slice(&buf[from..from + sample_bytes]);
        }
    }
}

fn deinterleave_from(src: &[u8], bufs: &mut [&mut [u8]], frames: usize, sample_bytes: usize) {
    let channels = bufs.len();
    for frame in 0..frames {
        for (ch, buf) in bufs.iter_mut().enumerate() {
            let from = (frame * channels + ch) * sample_bytes;
            let to = frame * sample_bytes;
            buf[to..to + sample_bytes].copy_from_slice(&src[from..from + sample_bytes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_and_deinterleave_are_inverses() {
        let left = [1u8, 2, 3, 4];
        let right = [5u8, 6, 7, 8];
        let mut inter = vec![0u8; 8];
        interleave_into(&mut inter, &[&left, &right], 2, 2);
        assert_eq!(inter, [1, 2, 5, 6, 3, 4, 7, 8]);

        let mut out_l = [0u8; 4];
        let mut out_r = [0u8; 4];
        deinterleave_from(&inter, &mut [&mut out_l, &mut out_r], 2, 2);
        assert_eq!(out_l, left);
        assert_eq!(out_r, right);
    }

    #[test]
    fn sample_format_mapping_covers_host_order_integers() {
        assert_eq!(
            cpal_sample_format(SampleCoding::U8).unwrap(),
            cpal::SampleFormat::U8
        );
        let native_s16 = if cfg!(target_endian = "big") {
            SampleCoding::S16_BE
        } else {
            SampleCoding::S16_LE
        };
        assert_eq!(
            cpal_sample_format(native_s16).unwrap(),
            cpal::SampleFormat::I16
        );
        // Packed 24-bit has no CPAL integer type.
        assert!(cpal_sample_format(SampleCoding::S24_3LE).is_err());
    }

    #[test]
    fn sample_format_mapping_rejects_foreign_byte_order() {
        let foreign = if cfg!(target_endian = "big") {
            SampleCoding::S16_LE
        } else {
            SampleCoding::S16_BE
        };
        assert!(cpal_sample_format(foreign).is_err());
    }

    #[test]
    fn device_name_matching_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }
}
