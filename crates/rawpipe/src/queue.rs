//! Bounded byte ring between the blocking session API and the real-time
//! audio callback.
//!
//! A single [`Condvar`] signals every state change. All transfers move whole
//! granules (frames) so the callback never splits a frame across refills.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct ByteRing {
    inner: Mutex<RingInner>,
    cv: Condvar,
    capacity: usize,
}

struct RingInner {
    buf: VecDeque<u8>,
    closed: bool,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cv: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Drop all buffered bytes (stream reset after a glitch).
    pub fn clear(&self) {
        self.inner.lock().unwrap().buf.clear();
        self.cv.notify_all();
    }

    /// Push as many whole granules as currently fit. Returns bytes pushed.
    pub fn push_available(&self, data: &[u8], granule: usize) -> usize {
        let mut g = self.inner.lock().unwrap();
        if g.closed {
            return 0;
        }
        let free = self.capacity.saturating_sub(g.buf.len());
        let take = (free.min(data.len()) / granule) * granule;
        g.buf.extend(&data[..take]);
        drop(g);
        if take > 0 {
            self.cv.notify_all();
        }
        take
    }

    /// Pop up to `out.len()` bytes in whole granules. Returns bytes popped.
    pub fn pop_available(&self, out: &mut [u8], granule: usize) -> usize {
        let mut g = self.inner.lock().unwrap();
        let take = (g.buf.len().min(out.len()) / granule) * granule;
        for slot in out[..take].iter_mut() {
            *slot = g.buf.pop_front().unwrap_or(0);
        }
        drop(g);
        if take > 0 {
            self.cv.notify_all();
        }
        take
    }

    /// Wait until at least one granule of free space exists (or the ring is
    /// closed). Returns `true` when space is available.
    pub fn wait_space(&self, granule: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.closed || self.capacity - g.buf.len() >= granule {
                return !g.closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }
    }

    /// Wait until at least one granule is buffered (or the ring is closed).
    pub fn wait_data(&self, granule: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.buf.len() >= granule {
                return true;
            }
            if g.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }
    }

    /// Wait until the ring drains completely. Returns `true` when empty.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.buf.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }
    }
}
