//! Time sources for the decision engine.
//!
//! Algorithms never read the wall clock themselves. The checker samples a
//! [`Clock`] once per check and passes the instant down, which keeps every
//! evaluation deterministic under a [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of "now", expressed as the offset from the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// A clock that only moves when told to. Microsecond resolution.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            micros: AtomicU64::new(start.as_micros() as u64),
        }
    }

    /// Start at a whole number of seconds since the epoch.
    pub fn at_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn set(&self, now: Duration) {
        self.micros.store(now.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}
