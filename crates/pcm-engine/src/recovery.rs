//! Device-glitch recovery.
//!
//! Entered only when an I/O attempt reports a glitch; never polled on its
//! own. Every action completes before the transfer loop retries, and frames
//! the device already accepted are never re-issued.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::session::{Direction, DeviceSession, ResumeOutcome, SessionState};

/// Recovery-relevant states of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    Running,
    Xrun,
    Suspended,
    DrainRetry,
    Fatal,
}

/// Outcome of a recovery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// The stream is prepared again; retry the remainder of the transfer.
    Recovered,
    /// The condition cannot be recovered from; end the transfer.
    Escalate(String),
}

fn xrun_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Playback => "underrun",
        Direction::Capture => "overrun",
    }
}

/// Handle an xrun indication from the device.
///
/// Queries the status to classify the glitch, reports its duration when the
/// session provides a trigger timestamp, and reprepares the stream.
pub fn recover_glitch<S: DeviceSession + ?Sized>(
    session: &mut S,
    fatal_xruns: bool,
) -> Result<Recovery> {
    let status = session.status()?;
    let direction = session.direction();

    match status.state {
        SessionState::Xrun => {
            tracing::debug!(from = ?RecoveryState::Running, to = ?RecoveryState::Xrun, "device glitch");
            if fatal_xruns {
                return Ok(Recovery::Escalate(format!(
                    "fatal {}",
                    xrun_name(direction)
                )));
            }
            match status.trigger {
                Some(trigger) => {
                    let lost_ms = trigger.elapsed().as_secs_f64() * 1000.0;
                    tracing::warn!(duration_ms = lost_ms, "{}!!!", xrun_name(direction));
                }
                None => tracing::warn!("{}!!!", xrun_name(direction)),
            }
            session.prepare()?;
            Ok(Recovery::Recovered)
        }
        SessionState::Draining if direction == Direction::Capture => {
            tracing::debug!(from = ?RecoveryState::Running, to = ?RecoveryState::DrainRetry, "capture drain");
            tracing::warn!("capture stream format change? attempting recover...");
            session.prepare()?;
            Ok(Recovery::Recovered)
        }
        other => {
            tracing::debug!(from = ?RecoveryState::Running, to = ?RecoveryState::Fatal, "unrecognized device state");
            Ok(Recovery::Escalate(format!(
                "read/write error, state = {}",
                other.name()
            )))
        }
    }
}

/// Handle a suspend indication from the device.
///
/// Retries resume while the device reports "try again", then falls back to
/// repreparing the stream so the transfer can continue either way.
pub fn recover_suspend<S: DeviceSession + ?Sized>(
    session: &mut S,
    retry_delay: Duration,
) -> Result<Recovery> {
    tracing::debug!(from = ?RecoveryState::Running, to = ?RecoveryState::Suspended, "device suspended");
    tracing::warn!("suspended, trying resume");
    loop {
        match session.resume()? {
            ResumeOutcome::Resumed => {
                tracing::warn!("resume done");
                return Ok(Recovery::Recovered);
            }
            ResumeOutcome::Busy => thread::sleep(retry_delay),
            ResumeOutcome::Failed => break,
        }
    }
    tracing::warn!("resume failed, restarting stream");
    session.prepare()?;
    Ok(Recovery::Recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SampleCoding, StreamFormat};
    use crate::session::script::ScriptedSession;

    fn session(direction: Direction) -> ScriptedSession {
        let format = StreamFormat::new(SampleCoding::S16_LE, 2, 48_000).unwrap();
        ScriptedSession::new(format, direction)
    }

    #[test]
    fn xrun_reprepares_and_recovers() {
        let mut s = session(Direction::Playback);
        s.push_status(SessionState::Xrun);
        let outcome = recover_glitch(&mut s, false).unwrap();
        assert_eq!(outcome, Recovery::Recovered);
        assert_eq!(s.prepares, 1);
    }

    #[test]
    fn fatal_policy_escalates_without_repreparing() {
        let mut s = session(Direction::Playback);
        s.push_status(SessionState::Xrun);
        let outcome = recover_glitch(&mut s, true).unwrap();
        assert_eq!(outcome, Recovery::Escalate("fatal underrun".into()));
        assert_eq!(s.prepares, 0);
    }

    #[test]
    fn capture_overrun_names_the_glitch() {
        let mut s = session(Direction::Capture);
        s.push_status(SessionState::Xrun);
        let outcome = recover_glitch(&mut s, true).unwrap();
        assert_eq!(outcome, Recovery::Escalate("fatal overrun".into()));
    }

    #[test]
    fn draining_capture_reprepares() {
        let mut s = session(Direction::Capture);
        s.push_status(SessionState::Draining);
        let outcome = recover_glitch(&mut s, false).unwrap();
        assert_eq!(outcome, Recovery::Recovered);
        assert_eq!(s.prepares, 1);
    }

    #[test]
    fn draining_playback_is_fatal() {
        let mut s = session(Direction::Playback);
        s.push_status(SessionState::Draining);
        let outcome = recover_glitch(&mut s, false).unwrap();
        assert_eq!(
            outcome,
            Recovery::Escalate("read/write error, state = DRAINING".into())
        );
    }

    #[test]
    fn unrecognized_state_is_fatal() {
        let mut s = session(Direction::Playback);
        s.push_status(SessionState::Setup);
        let outcome = recover_glitch(&mut s, false).unwrap();
        assert_eq!(
            outcome,
            Recovery::Escalate("read/write error, state = SETUP".into())
        );
    }

    #[test]
    fn suspend_retries_until_resumed() {
        let mut s = session(Direction::Playback);
        s.resumes.push_back(ResumeOutcome::Busy);
        s.resumes.push_back(ResumeOutcome::Resumed);
        let outcome = recover_suspend(&mut s, Duration::from_millis(1)).unwrap();
        assert_eq!(outcome, Recovery::Recovered);
        assert_eq!(s.prepares, 0);
    }

    #[test]
    fn suspend_falls_back_to_prepare_when_resume_fails() {
        let mut s = session(Direction::Playback);
        s.resumes.push_back(ResumeOutcome::Failed);
        let outcome = recover_suspend(&mut s, Duration::from_millis(1)).unwrap();
        assert_eq!(outcome, Recovery::Recovered);
        assert_eq!(s.prepares, 1);
    }
}
