//! One-shot latch event with bounded waits.
//!
//! A `LatchEvent` is signalled from one execution domain and awaited,
//! with a timeout, from another. The streaming engine uses it for the
//! "has the first isochronous callback happened yet?" handshake and for
//! command-response rendezvous, where the waiter must give up after a
//! bounded interval rather than block forever on a hung device.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

/// A resettable one-shot event.
///
/// `signal` transitions the latch to the signalled state and wakes all
/// waiters; it stays signalled until `reset`. Waiting on an already
/// signalled latch returns immediately.
pub struct LatchEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl LatchEvent {
    /// Create an unsignalled latch.
    pub const fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A poisoned latch only means a panicking waiter; the flag is valid.
        self.signalled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal the latch and wake every waiter.
    pub fn signal(&self) {
        let mut signalled = self.lock();
        *signalled = true;
        self.cond.notify_all();
    }

    /// Return the latch to the unsignalled state.
    pub fn reset(&self) {
        *self.lock() = false;
    }

    /// Whether the latch is currently signalled.
    pub fn is_signalled(&self) -> bool {
        *self.lock()
    }

    /// Block until the latch is signalled or `timeout` elapses.
    ///
    /// Returns `true` if the latch was signalled, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (signalled, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |signalled| !*signalled)
            .unwrap_or_else(|e| e.into_inner());
        *signalled
    }
}

impl Default for LatchEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn test_signal_before_wait() {
        let latch = LatchEvent::new();
        latch.signal();
        assert!(latch.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_timeout_when_never_signalled() {
        let latch = LatchEvent::new();
        let start = Instant::now();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_from_other_thread() {
        let latch = Arc::new(LatchEvent::new());
        let signaller = Arc::clone(&latch);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.signal();
        });

        assert!(latch.wait_timeout(Duration::from_secs(1)));
        handle.join().unwrap();
    }

    #[test]
    fn test_reset_rearms() {
        let latch = LatchEvent::new();
        latch.signal();
        assert!(latch.is_signalled());

        latch.reset();
        assert!(!latch.is_signalled());
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
    }
}
