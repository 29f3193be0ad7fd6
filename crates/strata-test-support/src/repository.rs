//! In-memory and failing `EventRepository` implementations for tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use strata_core::bus::EventBus;
use strata_core::error::DomainError;
use strata_core::repository::{EventRepository, EventStream, StoredEvent, validate_batch};
use uuid::Uuid;

/// Builds a stored event with fresh IDs and the current time.
#[must_use]
pub fn stored_event(
    aggregate_id: Uuid,
    sequence_number: i64,
    event_type: &str,
    payload: serde_json::Value,
) -> StoredEvent {
    StoredEvent {
        event_id: Uuid::new_v4(),
        aggregate_id,
        aggregate_type: "test".to_owned(),
        event_type: event_type.to_owned(),
        payload,
        schema_version: 1,
        sequence_number,
        correlation_id: Uuid::new_v4(),
        causation_id: Uuid::new_v4(),
        occurred_at: Utc::now(),
        position: 0,
    }
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<StoredEvent>,
    batches: Vec<(Uuid, i64, Vec<StoredEvent>)>,
    next_position: i64,
}

impl Log {
    fn last_sequence(&self, aggregate_id: Uuid) -> i64 {
        self.events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.sequence_number)
            .max()
            .unwrap_or(0)
    }

    fn push(&mut self, mut event: StoredEvent) -> StoredEvent {
        self.next_position += 1;
        event.position = self.next_position;
        self.events.push(event.clone());
        event
    }
}

/// An event store held in memory with the same compare-and-swap and
/// global-ordering behavior as the PostgreSQL store.
///
/// Appended batches are recorded for assertions, and committed events are
/// published on the attached bus, if any.
#[derive(Debug, Default)]
pub struct InMemoryEventRepository {
    log: Mutex<Log>,
    bus: Option<EventBus>,
}

impl InMemoryEventRepository {
    /// Creates an empty store with no bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store publishing to `bus`.
    #[must_use]
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            log: Mutex::default(),
            bus: Some(bus),
        }
    }

    /// Inserts events as-is, bypassing concurrency checks and the bus.
    ///
    /// Used to stage legacy payloads. Positions are assigned in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed(&self, events: Vec<StoredEvent>) {
        let mut log = self.log.lock().unwrap();
        for event in events {
            log.push(event);
        }
    }

    /// Returns every `(aggregate_id, expected_sequence, batch)` appended.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn appended_batches(&self) -> Vec<(Uuid, i64, Vec<StoredEvent>)> {
        self.log.lock().unwrap().batches.clone()
    }

    /// Returns every stored event in position order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.log.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn append_events(
        &self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: &[StoredEvent],
    ) -> Result<i64, DomainError> {
        validate_batch(aggregate_id, expected_sequence, events)?;
        if events.is_empty() {
            return Ok(expected_sequence);
        }

        let committed = {
            let mut log = self.log.lock().unwrap();
            let actual = log.last_sequence(aggregate_id);
            if actual != expected_sequence {
                return Err(DomainError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_sequence,
                    actual,
                });
            }
            let committed: Vec<StoredEvent> =
                events.iter().cloned().map(|e| log.push(e)).collect();
            log.batches.push((aggregate_id, expected_sequence, events.to_vec()));
            committed
        };

        if let Some(bus) = &self.bus {
            bus.publish(&committed);
        }
        Ok(committed
            .last()
            .map_or(expected_sequence, |e| e.sequence_number))
    }

    fn read_stream(&self, aggregate_id: Uuid, from_sequence: i64) -> EventStream<'_> {
        let mut events: Vec<StoredEvent> = self
            .log
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.sequence_number >= from_sequence)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence_number);
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn read_all(
        &self,
        after_position: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(self
            .log
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.position > after_position)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_event(&self, event_id: Uuid) -> Result<Option<StoredEvent>, DomainError> {
        Ok(self
            .log
            .lock()
            .unwrap()
            .events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned())
    }

    async fn current_sequence(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        Ok(self.log.lock().unwrap().last_sequence(aggregate_id))
    }
}

/// An event repository that always returns an infrastructure error. Useful for
/// testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventRepository;

#[async_trait]
impl EventRepository for FailingEventRepository {
    async fn append_events(
        &self,
        _aggregate_id: Uuid,
        _expected_sequence: i64,
        _events: &[StoredEvent],
    ) -> Result<i64, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    fn read_stream(&self, _aggregate_id: Uuid, _from_sequence: i64) -> EventStream<'_> {
        stream::once(async { Err(DomainError::Infrastructure("connection refused".into())) })
            .boxed()
    }

    async fn read_all(
        &self,
        _after_position: i64,
        _limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn load_event(&self, _event_id: Uuid) -> Result<Option<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn current_sequence(&self, _aggregate_id: Uuid) -> Result<i64, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }
}
