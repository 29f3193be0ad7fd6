//! Deterministic `Clock` implementations for tests.

use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use strata_core::clock::Clock;

/// A clock that always returns a fixed point in time.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// A clock frozen at 2024-01-01T00:00:00Z.
    ///
    /// # Panics
    ///
    /// Never panics; the timestamp is a valid constant.
    #[must_use]
    pub fn new_year() -> Self {
        Self(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A clock that moves forward by a fixed step every time it is read.
#[derive(Debug)]
pub struct TickingClock {
    next: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl TickingClock {
    /// Starts at `start`, advancing `step` per reading.
    #[must_use]
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }
}

impl Clock for TickingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = self.next.lock().unwrap();
        let now = *next;
        *next = now + self.step;
        now
    }
}
