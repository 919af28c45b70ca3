//! Wall-clock time source

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// Source of the current UNIX time in seconds
pub trait Clock: Send + Sync {
    /// Current UNIX time in seconds
    fn now(&self) -> Timestamp;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now`
    pub fn new(now: Timestamp) -> Self { Self { now: AtomicU64::new(now) } }

    /// Sets the time
    pub fn set(&self, now: Timestamp) { self.now.store(now, Ordering::SeqCst) }

    /// Moves the time forward by `secs`
    pub fn advance(&self, secs: u64) { self.now.fetch_add(secs, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp { self.now.load(Ordering::SeqCst) }
}
