//! Process-wide control flags.
//!
//! Abort and capture-rotation requests arrive asynchronously (signal
//! handlers, other threads). The engine never reads ambient global state;
//! it polls this shared object at chunk boundaries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared abort/rotate flags, settable from any thread.
#[derive(Debug, Default)]
pub struct SignalFlags {
    abort: AtomicBool,
    rotate: AtomicBool,
}

impl SignalFlags {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request termination. In-flight device calls finish; no new chunk starts.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn aborting(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Request capture-file rotation independent of the size threshold.
    ///
    /// Idempotent: setting it twice before it is observed is one rotation.
    pub fn request_rotate(&self) {
        self.rotate.store(true, Ordering::Relaxed);
    }

    /// Consume a pending rotation request, re-arming the flag.
    pub fn take_rotate(&self) -> bool {
        self.rotate.swap(false, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_sticky() {
        let flags = SignalFlags::default();
        assert!(!flags.aborting());
        flags.request_abort();
        assert!(flags.aborting());
        assert!(flags.aborting());
    }

    #[test]
    fn take_rotate_consumes_the_request() {
        let flags = SignalFlags::default();
        assert!(!flags.take_rotate());
        flags.request_rotate();
        flags.request_rotate();
        assert!(flags.take_rotate());
        assert!(!flags.take_rotate());
    }
}
