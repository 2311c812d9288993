//! Rate limiting for diagnostics emitted from the packet path.
//!
//! A malformed packet storm must not turn into a log storm. Each
//! diagnostic site keeps a `LogGate` and only logs when the gate opens;
//! the gate admits one record per interval and silently drops the rest.

use std::time::{Duration, Instant};

use spin::Mutex;

/// A per-site gate admitting one event per interval.
///
/// Suitable for static use:
///
/// ```
/// use std::time::Duration;
/// use fwa_core::ratelimit::LogGate;
///
/// static BAD_HEADER: LogGate = LogGate::new(Duration::from_secs(1));
///
/// if BAD_HEADER.allow() {
///     // log the diagnostic
/// }
/// ```
pub struct LogGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogGate {
    /// Create a gate admitting one event per `interval`.
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Whether the caller may emit its diagnostic now.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(stamp) if now.duration_since(stamp) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
