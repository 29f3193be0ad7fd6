//! In-memory `SagaRepository`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use strata_core::error::DomainError;
use strata_core::saga::{SagaInstance, SagaRepository, SagaStatus};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    instances: HashMap<Uuid, SagaInstance>,
    history: Vec<SagaInstance>,
    checkpoints: HashMap<String, i64>,
}

/// Saga store held in memory. Every saved state is kept in a history for
/// assertions on the saga's transitions.
#[derive(Debug, Default)]
pub struct InMemorySagaRepository {
    state: Mutex<State>,
}

impl InMemorySagaRepository {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every state saved for a saga, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn history(&self, saga_id: Uuid) -> Vec<SagaInstance> {
        self.state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|i| i.saga_id == saga_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn insert(&self, instance: &SagaInstance) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        if state.instances.contains_key(&instance.saga_id) {
            return Ok(false);
        }
        state.instances.insert(instance.saga_id, instance.clone());
        state.history.push(instance.clone());
        Ok(true)
    }

    async fn save(&self, instance: &SagaInstance) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        state.instances.insert(instance.saga_id, instance.clone());
        state.history.push(instance.clone());
        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> Result<Option<SagaInstance>, DomainError> {
        Ok(self.state.lock().unwrap().instances.get(&saga_id).cloned())
    }

    async fn delete(&self, saga_id: Uuid) -> Result<(), DomainError> {
        self.state.lock().unwrap().instances.remove(&saga_id);
        Ok(())
    }

    async fn list_unfinished(&self, saga_type: &str) -> Result<Vec<SagaInstance>, DomainError> {
        let mut unfinished: Vec<SagaInstance> = self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| {
                i.saga_type == saga_type
                    && matches!(i.status, SagaStatus::Running | SagaStatus::Compensating)
            })
            .cloned()
            .collect();
        unfinished.sort_by_key(|i| i.started_at);
        Ok(unfinished)
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
