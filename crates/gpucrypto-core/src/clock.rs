//! Microsecond timestamp sources for stream timing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic microsecond clock used to bracket stream operations.
pub trait TimestampSource: Send + Sync {
    /// Current time in microseconds. Must never go backwards.
    fn now_usec(&self) -> u64;
}

/// Wall-clock independent timestamps measured from the clock's creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose epoch is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampSource for MonotonicClock {
    fn now_usec(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock for deterministic timing in tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at `start_usec`.
    #[must_use]
    pub fn new(start_usec: u64) -> Self {
        Self {
            now: AtomicU64::new(start_usec),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, usec: u64) {
        self.now.fetch_add(usec, Ordering::AcqRel);
    }

    /// Jumps to an absolute time. Ignored if it would move backwards.
    pub fn set(&self, usec: u64) {
        self.now.fetch_max(usec, Ordering::AcqRel);
    }
}

impl TimestampSource for ManualClock {
    fn now_usec(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
