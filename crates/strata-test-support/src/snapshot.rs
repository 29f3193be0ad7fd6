//! In-memory `SnapshotRepository`.

use std::sync::Mutex;

use async_trait::async_trait;
use strata_core::error::DomainError;
use strata_core::snapshot::{Snapshot, SnapshotRepository};
use uuid::Uuid;

/// Snapshot store held in memory. Each entry carries a completion marker.
#[derive(Debug, Default)]
pub struct InMemorySnapshotRepository {
    entries: Mutex<Vec<(Snapshot, bool)>>,
}

impl InMemorySnapshotRepository {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot without its completion marker, as a writer that
    /// crashed mid-save would leave it.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn save_incomplete(&self, snapshot: Snapshot) {
        self.entries.lock().unwrap().push((snapshot, false));
    }

    /// Returns every completed snapshot in save order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn completed(&self) -> Vec<Snapshot> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, complete)| *complete)
            .map(|(snapshot, _)| snapshot.clone())
            .collect()
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(snapshot, complete)| *complete && snapshot.aggregate_id == aggregate_id)
            .max_by_key(|(snapshot, _)| snapshot.sequence_number)
            .map(|(snapshot, _)| snapshot.clone()))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        let mut entries = self.entries.lock().unwrap();
        entries.push((snapshot.clone(), false));
        if let Some(entry) = entries.last_mut() {
            entry.1 = true;
        }
        Ok(())
    }
}
