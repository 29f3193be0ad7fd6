//! Aggregate snapshots.
//!
//! A snapshot captures an aggregate's state after a given sequence number
//! so rehydration can skip replaying the events before it. Snapshots are a
//! cache: the event stream stays authoritative, and a missing, incomplete
//! or undecodable snapshot only means a longer replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec::VersionedDocument;
use crate::error::DomainError;

/// A point-in-time capture of an aggregate's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The aggregate captured.
    pub aggregate_id: Uuid,
    /// The aggregate's type name.
    pub aggregate_type: String,
    /// Sequence number of the last event folded into `state`.
    pub sequence_number: i64,
    /// Encoded aggregate state.
    pub state: VersionedDocument,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Persistence for snapshots.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Returns the newest completed snapshot of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError>;

    /// Persists a snapshot.
    ///
    /// The snapshot is written first and marked complete in a separate
    /// step. A snapshot never marked complete is ignored by [`latest`].
    ///
    /// [`latest`]: SnapshotRepository::latest
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), DomainError>;
}

/// Decides when to take a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Take a snapshot each time the stream crosses a multiple of this many
    /// events. `0` disables snapshots.
    pub every: i64,
}

impl SnapshotPolicy {
    /// Snapshot every `every` events.
    #[must_use]
    pub fn every(every: i64) -> Self {
        Self { every }
    }

    /// Never snapshot.
    #[must_use]
    pub fn never() -> Self {
        Self { every: 0 }
    }

    /// Returns `true` if a commit taking the stream from `previous` to
    /// `current` crossed a snapshot threshold.
    #[must_use]
    pub fn should_snapshot(&self, previous: i64, current: i64) -> bool {
        self.every > 0 && current / self.every > previous / self.every
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::every(50)
    }
}
