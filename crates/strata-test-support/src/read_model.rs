//! In-memory `ReadModelStore`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use strata_core::error::DomainError;
use strata_core::projection::{ReadModelRecord, ReadModelStore};

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<(String, String), ReadModelRecord>,
    checkpoints: HashMap<String, i64>,
    saves: usize,
}

/// Read-model store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryReadModelStore {
    state: Mutex<State>,
}

impl InMemoryReadModelStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every record of a projection, ordered by record ID.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn records(&self, projection: &str) -> Vec<ReadModelRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|r| r.projection == projection)
            .cloned()
            .collect()
    }

    /// Returns how many record writes the store has accepted.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn save_count(&self) -> usize {
        self.state.lock().unwrap().saves
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    async fn load(
        &self,
        projection: &str,
        record_id: &str,
    ) -> Result<Option<ReadModelRecord>, DomainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .get(&(projection.to_owned(), record_id.to_owned()))
            .cloned())
    }

    async fn save(&self, record: &ReadModelRecord) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            (record.projection.clone(), record.record_id.clone()),
            record.clone(),
        );
        state.saves += 1;
        Ok(())
    }

    async fn clear(&self, projection: &str) -> Result<(), DomainError> {
        self.state
            .lock()
            .unwrap()
            .records
            .retain(|(p, _), _| p != projection);
        Ok(())
    }

    async fn checkpoint(&self, subscriber: &str) -> Result<i64, DomainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(subscriber)
            .copied()
            .unwrap_or(0))
    }

    async fn save_checkpoint(&self, subscriber: &str, position: i64) -> Result<(), DomainError> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .insert(subscriber.to_owned(), position);
        Ok(())
    }
}
