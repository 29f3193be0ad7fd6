//! Time source for event, snapshot, ledger and saga timestamps.

use chrono::{DateTime, Utc};

/// Supplies `occurred_at`, `taken_at`, `applied_at` and saga timestamps.
///
/// Aggregates never read a clock inside `apply`; commands take the time
/// from here so replays stay deterministic.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time, used by the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
