//! Monotonic change clock for stamping local mutations.
//!
//! Wall clocks can stand still (two edits in the same millisecond) or step
//! backwards. The sync engine only needs one property from a change stamp:
//! a later mutation of the same store always gets a strictly larger stamp.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// A clock that issues strictly increasing stamps.
///
/// Ordering rules:
/// 1. A stamp is never lower than the wall-clock time passed in
/// 2. A stamp is always greater than every stamp issued or observed before
#[derive(Debug, Default)]
pub struct ChangeClock {
    last: AtomicU64,
}

impl ChangeClock {
    /// Create a new clock, starting at zero.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Create a clock that resumes after a known high-water mark.
    pub fn starting_at(last: Timestamp) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Issue the next stamp: `max(now, last + 1)`.
    pub fn tick(&self, now: Timestamp) -> Timestamp {
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Raise the high-water mark to at least `stamp`.
    /// Used when importing state stamped by an earlier process.
    pub fn observe(&self, stamp: Timestamp) {
        self.last.fetch_max(stamp, Ordering::AcqRel);
    }

    /// The highest stamp issued or observed so far.
    pub fn high_water(&self) -> Timestamp {
        self.last.load(Ordering::Acquire)
    }
}
