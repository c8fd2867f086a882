//! Device session boundary.
//!
//! The engine never negotiates hardware parameters. A [`DeviceSession`] is
//! handed in already configured for the stream format, chunk size and buffer
//! size of the transfer; the trait only covers the primitives the transfer
//! loop and the recovery path need.

use std::time::{Duration, Instant};

use crate::error::Result;

/// Direction of a stream relative to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}

/// Result of one read/write attempt against the device.
///
/// Anything not representable here is a terminal error and is returned as
/// `Err` by the session instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoAttempt {
    /// The device accepted/delivered this many frames (possibly fewer than
    /// requested).
    Frames(usize),
    /// The device is not ready; retry after waiting for readiness.
    WouldBlock,
    /// Underrun (playback) or overrun (capture).
    Xrun,
    /// The device has been suspended.
    Suspended,
    /// A non-interleaved call could not report one frame count covering all
    /// channels.
    ChannelMismatch,
}

/// Result of a resume attempt on a suspended device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    /// Suspend flag not yet released; try again later.
    Busy,
    /// The device cannot resume; reprepare instead.
    Failed,
}

/// Device state as reported by a status query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Xrun,
    Draining,
    Suspended,
    Setup,
    Disconnected,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Running => "RUNNING",
            SessionState::Xrun => "XRUN",
            SessionState::Draining => "DRAINING",
            SessionState::Suspended => "SUSPENDED",
            SessionState::Setup => "SETUP",
            SessionState::Disconnected => "DISCONNECTED",
        }
    }
}

/// Snapshot returned by [`DeviceSession::status`].
#[derive(Clone, Copy, Debug)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Instant of the event that put the device into its current state, when
    /// the session can provide one (used to report glitch duration).
    pub trigger: Option<Instant>,
    /// Frames available for I/O.
    pub avail: i64,
    /// Frames queued in the device.
    pub delay: i64,
}

/// An open, fully negotiated PCM device.
///
/// All calls are synchronous. Non-interleaved variants take one buffer per
/// channel and must report a single frame count covering every channel.
pub trait DeviceSession {
    fn direction(&self) -> Direction;

    fn write_interleaved(&mut self, data: &[u8], frames: usize) -> Result<IoAttempt>;

    fn read_interleaved(&mut self, data: &mut [u8], frames: usize) -> Result<IoAttempt>;

    fn write_channels(&mut self, bufs: &[&[u8]], frames: usize) -> Result<IoAttempt>;

    fn read_channels(&mut self, bufs: &mut [&mut [u8]], frames: usize) -> Result<IoAttempt>;

    fn status(&mut self) -> Result<SessionStatus>;

    /// Reset the stream after a glitch so data is accepted again.
    fn prepare(&mut self) -> Result<()>;

    /// Attempt to resume a suspended stream.
    fn resume(&mut self) -> Result<ResumeOutcome>;

    /// Wait for the device to become ready for more I/O.
    ///
    /// Returns `true` if the device signalled readiness before the timeout.
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool>;

    /// Block until already-queued audio has been played out.
    fn drain(&mut self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod script {
    //! Scripted session for exercising the transfer loop and recovery paths.

    use std::collections::VecDeque;
    use std::sync::Arc;

    use super::*;
    use crate::error::EngineError;
    use crate::format::StreamFormat;
    use crate::signal::SignalFlags;

    /// One scripted response to an I/O attempt.
    pub(crate) enum Step {
        Accept(usize),
        WouldBlock,
        Xrun,
        Suspended,
        Mismatch,
        Fail(&'static str),
        /// Accept frames, then raise the abort flag (models a termination
        /// request arriving while a chunk is in flight).
        AcceptAndAbort(usize, Arc<SignalFlags>),
    }

    pub(crate) struct ScriptedSession {
        pub(crate) format: StreamFormat,
        pub(crate) direction: Direction,
        pub(crate) steps: VecDeque<Step>,
        pub(crate) statuses: VecDeque<SessionStatus>,
        pub(crate) resumes: VecDeque<ResumeOutcome>,
        /// Interleaved bytes the device accepted, in order.
        pub(crate) accepted: Vec<u8>,
        /// Per-channel bytes accepted by vectored writes.
        pub(crate) accepted_channels: Vec<Vec<u8>>,
        /// Byte fed to reads, repeated.
        pub(crate) feed_byte: u8,
        pub(crate) prepares: usize,
        pub(crate) waits: usize,
        pub(crate) drained: bool,
    }

    impl ScriptedSession {
        pub(crate) fn new(format: StreamFormat, direction: Direction) -> Self {
            Self {
                format,
                direction,
                steps: VecDeque::new(),
                statuses: VecDeque::new(),
                resumes: VecDeque::new(),
                accepted: Vec::new(),
                accepted_channels: vec![Vec::new(); format.channels()],
                feed_byte: 0x5a,
                prepares: 0,
                waits: 0,
                drained: false,
            }
        }

        pub(crate) fn push(&mut self, step: Step) -> &mut Self {
            self.steps.push_back(step);
            self
        }

        pub(crate) fn push_status(&mut self, state: SessionState) -> &mut Self {
            self.statuses.push_back(SessionStatus {
                state,
                trigger: Some(Instant::now()),
                avail: 0,
                delay: 0,
            });
            self
        }

        fn next_step(&mut self, requested: usize) -> Result<(usize, Option<IoAttempt>)> {
            match self.steps.pop_front() {
                // An exhausted script accepts everything.
                None => Ok((requested, None)),
                Some(Step::Accept(n)) => Ok((n.min(requested), None)),
                Some(Step::AcceptAndAbort(n, flags)) => {
                    flags.request_abort();
                    Ok((n.min(requested), None))
                }
                Some(Step::WouldBlock) => Ok((0, Some(IoAttempt::WouldBlock))),
                Some(Step::Xrun) => Ok((0, Some(IoAttempt::Xrun))),
                Some(Step::Suspended) => Ok((0, Some(IoAttempt::Suspended))),
                Some(Step::Mismatch) => Ok((0, Some(IoAttempt::ChannelMismatch))),
                Some(Step::Fail(reason)) => Err(EngineError::Device(reason.into())),
            }
        }
    }

    impl DeviceSession for ScriptedSession {
        fn direction(&self) -> Direction {
            self.direction
        }

        fn write_interleaved(&mut self, data: &[u8], frames: usize) -> Result<IoAttempt> {
            let (n, special) = self.next_step(frames)?;
            if let Some(attempt) = special {
                return Ok(attempt);
            }
            let bytes = self.format.frames_to_bytes(n);
            self.accepted.extend_from_slice(&data[..bytes]);
            Ok(IoAttempt::Frames(n))
        }

        fn read_interleaved(&mut self, data: &mut [u8], frames: usize) -> Result<IoAttempt> {
            let (n, special) = self.next_step(frames)?;
            if let Some(attempt) = special {
                return Ok(attempt);
            }
            let bytes = self.format.frames_to_bytes(n);
            data[..bytes].fill(self.feed_byte);
            Ok(IoAttempt::Frames(n))
        }

        fn write_channels(&mut self, bufs: &[&[u8]], frames: usize) -> Result<IoAttempt> {
            let (n, special) = self.next_step(frames)?;
            if let Some(attempt) = special {
                return Ok(attempt);
            }
            let bytes = n * self.format.coding().bytes_per_sample();
            for (ch, buf) in bufs.iter().enumerate() {
                self.accepted_channels[ch].extend_from_slice(&buf[..bytes]);
            }
            Ok(IoAttempt::Frames(n))
        }

        fn read_channels(&mut self, bufs: &mut [&mut [u8]], frames: usize) -> Result<IoAttempt> {
            let (n, special) = self.next_step(frames)?;
            if let Some(attempt) = special {
                return Ok(attempt);
            }
            let bytes = n * self.format.coding().bytes_per_sample();
            for buf in bufs.iter_mut() {
                buf[..bytes].fill(self.feed_byte);
            }
            Ok(IoAttempt::Frames(n))
        }

        fn status(&mut self) -> Result<SessionStatus> {
            Ok(self.statuses.pop_front().unwrap_or(SessionStatus {
                state: SessionState::Running,
                trigger: None,
                avail: 0,
                delay: 0,
            }))
        }

        fn prepare(&mut self) -> Result<()> {
            self.prepares += 1;
            Ok(())
        }

        fn resume(&mut self) -> Result<ResumeOutcome> {
            Ok(self.resumes.pop_front().unwrap_or(ResumeOutcome::Failed))
        }

        fn wait_ready(&mut self, _timeout: Duration) -> Result<bool> {
            self.waits += 1;
            Ok(true)
        }

        fn drain(&mut self) -> Result<()> {
            self.drained = true;
            Ok(())
        }
    }
}
