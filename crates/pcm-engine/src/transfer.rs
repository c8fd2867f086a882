//! Chunked transfer between caller buffers and the device session.
//!
//! One engine instance owns the chunk geometry, the optional peak meter and
//! channel map, and a scratch buffer for interleaved remapping. It is built
//! once per playback/capture invocation and drives every chunk through the
//! same retry/recovery loop.

use std::sync::Arc;

use crate::chmap::ChannelMap;
use crate::config::TransferConfig;
use crate::error::{EngineError, Result};
use crate::format::StreamFormat;
use crate::meter::{MeterLevels, MeterMode, PeakMeter};
use crate::recovery::{self, Recovery};
use crate::session::{Direction, DeviceSession, IoAttempt};
use crate::signal::SignalFlags;

pub struct TransferEngine {
    format: StreamFormat,
    config: TransferConfig,
    signals: Arc<SignalFlags>,
    meter: Option<PeakMeter>,
    chmap: Option<ChannelMap>,
    remap_scratch: Vec<u8>,
}

impl TransferEngine {
    pub fn new(
        format: StreamFormat,
        config: TransferConfig,
        signals: Arc<SignalFlags>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            format,
            config,
            signals,
            meter: None,
            chmap: None,
            remap_scratch: Vec::new(),
        })
    }

    pub fn with_meter(mut self, mode: MeterMode) -> Self {
        self.meter = Some(PeakMeter::new(&self.format, mode));
        self
    }

    pub fn with_channel_map(mut self, map: ChannelMap) -> Result<Self> {
        if map.channels() != self.format.channels() {
            return Err(EngineError::Config(
                "channel numbers don't match between stream and channel map".into(),
            ));
        }
        self.remap_scratch = vec![0u8; self.chunk_bytes()];
        self.chmap = Some(map);
        Ok(self)
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn chunk_frames(&self) -> usize {
        self.config.chunk_frames
    }

    pub fn chunk_bytes(&self) -> usize {
        self.format.frames_to_bytes(self.config.chunk_frames)
    }

    pub fn signals(&self) -> &SignalFlags {
        &self.signals
    }

    pub fn meter_levels(&self) -> Option<MeterLevels> {
        self.meter.as_ref().map(PeakMeter::levels)
    }

    /// Write one chunk to the device.
    ///
    /// `data` must hold `chunk_bytes` capacity; `frames` of it are valid. A
    /// short chunk is padded with the format's silence pattern and sent
    /// whole. Returns the frames the device accepted — the padded chunk
    /// length unless the abort flag cut the loop short.
    pub fn transfer_out<S: DeviceSession + ?Sized>(
        &mut self,
        session: &mut S,
        data: &mut [u8],
        frames: usize,
    ) -> Result<usize> {
        let fb = self.format.frame_bytes();
        let chunk = self.config.chunk_frames;
        if frames < chunk {
            self.format
                .coding()
                .fill_silence(&mut data[frames * fb..chunk * fb]);
        }

        let src: &[u8] = match &self.chmap {
            Some(map) => {
                map.apply_interleaved(
                    &data[..chunk * fb],
                    &mut self.remap_scratch,
                    self.format.coding().bytes_per_sample(),
                );
                &self.remap_scratch
            }
            None => &data[..chunk * fb],
        };

        let mut done = 0usize;
        while done < chunk && !self.signals.aborting() {
            check_position(session, &self.config, &mut self.meter)?;
            let remaining = chunk - done;
            match session.write_interleaved(&src[done * fb..], remaining)? {
                IoAttempt::Frames(n) if n > 0 => {
                    if let Some(meter) = self.meter.as_mut() {
                        meter.observe(&src[done * fb..(done + n) * fb], n * self.format.channels());
                    }
                    done += n;
                    if done < chunk && !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Frames(_) | IoAttempt::WouldBlock => {
                    if !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Xrun => self.recover_glitch(session)?,
                IoAttempt::Suspended => self.recover_suspend(session)?,
                IoAttempt::ChannelMismatch => return Err(EngineError::ChannelMismatch),
            }
        }
        Ok(done)
    }

    /// Read one chunk from the device.
    ///
    /// Always reads whole chunks; returns `frames` unless the abort flag cut
    /// the loop short, in which case the shortfall is reported to the caller
    /// instead of failing.
    pub fn transfer_in<S: DeviceSession + ?Sized>(
        &mut self,
        session: &mut S,
        data: &mut [u8],
        frames: usize,
    ) -> Result<usize> {
        let fb = self.format.frame_bytes();
        let chunk = self.config.chunk_frames;

        let mut done = 0usize;
        while done < chunk {
            if self.signals.aborting() {
                return Ok(done.min(frames));
            }
            check_position(session, &self.config, &mut self.meter)?;
            let remaining = chunk - done;
            match session.read_interleaved(&mut data[done * fb..], remaining)? {
                IoAttempt::Frames(n) if n > 0 => {
                    if let Some(meter) = self.meter.as_mut() {
                        meter.observe(&data[done * fb..(done + n) * fb], n * self.format.channels());
                    }
                    done += n;
                    if done < chunk && !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Frames(_) | IoAttempt::WouldBlock => {
                    if !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Xrun => self.recover_glitch(session)?,
                IoAttempt::Suspended => self.recover_suspend(session)?,
                IoAttempt::ChannelMismatch => return Err(EngineError::ChannelMismatch),
            }
        }
        Ok(frames)
    }

    /// Non-interleaved write: one buffer per channel, one frame count
    /// covering all channels.
    pub fn transfer_out_channels<S: DeviceSession + ?Sized>(
        &mut self,
        session: &mut S,
        bufs: &mut [Vec<u8>],
        frames: usize,
    ) -> Result<usize> {
        let sb = self.format.coding().bytes_per_sample();
        let chunk = self.config.chunk_frames;
        debug_assert_eq!(bufs.len(), self.format.channels());

        if frames < chunk {
            for buf in bufs.iter_mut() {
                self.format
                    .coding()
                    .fill_silence(&mut buf[frames * sb..chunk * sb]);
            }
        }

        let natural: Vec<&[u8]> = bufs.iter().map(|b| b.as_slice()).collect();
        let ordered: Vec<&[u8]> = match &self.chmap {
            Some(map) => map.apply_channel_order(&natural),
            None => natural,
        };

        let mut done = 0usize;
        while done < chunk && !self.signals.aborting() {
            check_position(session, &self.config, &mut self.meter)?;
            let remaining = chunk - done;
            let views: Vec<&[u8]> = ordered.iter().map(|b| &b[done * sb..]).collect();
            match session.write_channels(&views, remaining)? {
                IoAttempt::Frames(n) if n > 0 => {
                    if let Some(meter) = self.meter.as_mut() {
                        for buf in &ordered {
                            meter.observe(&buf[done * sb..(done + n) * sb], n);
                        }
                    }
                    done += n;
                    if done < chunk && !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Frames(_) | IoAttempt::WouldBlock => {
                    if !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Xrun => self.recover_glitch(session)?,
                IoAttempt::Suspended => self.recover_suspend(session)?,
                IoAttempt::ChannelMismatch => return Err(EngineError::ChannelMismatch),
            }
        }
        Ok(done)
    }

    /// Non-interleaved read; mirrors [`TransferEngine::transfer_in`].
    pub fn transfer_in_channels<S: DeviceSession + ?Sized>(
        &mut self,
        session: &mut S,
        bufs: &mut [Vec<u8>],
        frames: usize,
    ) -> Result<usize> {
        let sb = self.format.coding().bytes_per_sample();
        let chunk = self.config.chunk_frames;
        debug_assert_eq!(bufs.len(), self.format.channels());

        let mut done = 0usize;
        while done < chunk {
            if self.signals.aborting() {
                return Ok(done.min(frames));
            }
            check_position(session, &self.config, &mut self.meter)?;
            let remaining = chunk - done;
            let mut views: Vec<&mut [u8]> =
                bufs.iter_mut().map(|b| &mut b[done * sb..]).collect();
            match session.read_channels(&mut views, remaining)? {
                IoAttempt::Frames(n) if n > 0 => {
                    drop(views);
                    if let Some(meter) = self.meter.as_mut() {
                        for buf in bufs.iter() {
                            meter.observe(&buf[done * sb..(done + n) * sb], n);
                        }
                    }
                    done += n;
                    if done < chunk && !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Frames(_) | IoAttempt::WouldBlock => {
                    if !self.config.no_wait {
                        session.wait_ready(self.config.ready_timeout)?;
                    }
                }
                IoAttempt::Xrun => self.recover_glitch(session)?,
                IoAttempt::Suspended => self.recover_suspend(session)?,
                IoAttempt::ChannelMismatch => return Err(EngineError::ChannelMismatch),
            }
        }
        Ok(frames)
    }

    fn recover_glitch<S: DeviceSession + ?Sized>(&self, session: &mut S) -> Result<()> {
        match recovery::recover_glitch(session, self.config.fatal_xruns)? {
            Recovery::Recovered => Ok(()),
            Recovery::Escalate(reason) => Err(EngineError::Device(reason)),
        }
    }

    fn recover_suspend<S: DeviceSession + ?Sized>(&self, session: &mut S) -> Result<()> {
        match recovery::recover_suspend(session, self.config.resume_retry_delay)? {
            Recovery::Recovered => Ok(()),
            Recovery::Escalate(reason) => Err(EngineError::Device(reason)),
        }
    }
}

/// Validate device position readings when the check is configured.
///
/// A suspicious reading is reported and invalidates the meter's window.
fn check_position<S: DeviceSession + ?Sized>(
    session: &mut S,
    config: &TransferConfig,
    meter: &mut Option<PeakMeter>,
) -> Result<()> {
    let Some(check) = config.position_check else {
        return Ok(());
    };
    let status = session.status()?;
    let out_of_range = check.coef * config.buffer_frames as i64 / 2;
    let suspicious = status.avail > out_of_range
        || status.avail < -out_of_range
        || status.delay > out_of_range
        || status.delay < -out_of_range
        || (session.direction() == Direction::Capture && status.avail > status.delay);
    if suspicious {
        tracing::warn!(
            avail = status.avail,
            delay = status.delay,
            buffer = config.buffer_frames,
            "suspicious buffer position"
        );
        if let Some(meter) = meter {
            meter.reset_window();
        }
    }
    Ok(())
}
