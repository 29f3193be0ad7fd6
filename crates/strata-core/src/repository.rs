//! Event store abstraction.

use async_trait::async_trait;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::DomainError;

/// Stored representation of a domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Type of the aggregate this event belongs to.
    pub aggregate_type: String,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Schema version the payload was written with.
    pub schema_version: i32,
    /// Sequence number within the aggregate stream.
    pub sequence_number: i64,
    /// Correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Causation ID linking to the causing event/command.
    pub causation_id: Uuid,
    /// Timestamp of event creation.
    pub occurred_at: chrono::DateTime<chrono::Utc>,
    /// Global ordinal in commit order; `0` until the store has assigned one.
    pub position: i64,
}

/// Lazy, ordered stream of events read from a store.
pub type EventStream<'a> = BoxStream<'a, Result<StoredEvent, DomainError>>;

/// Repository trait for reading and appending domain events.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append new events to an aggregate stream with optimistic concurrency.
    ///
    /// `expected_sequence` is the last sequence number the caller observed.
    /// Returns the stream's new last sequence number. A successful append
    /// publishes the events to in-process subscribers.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if `expected_sequence` is
    /// not the stored maximum, `DomainError::Validation` if the batch is not
    /// numbered contiguously after `expected_sequence`, and
    /// `DomainError::Infrastructure` for store failures.
    async fn append_events(
        &self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: &[StoredEvent],
    ) -> Result<i64, DomainError>;

    /// Streams an aggregate's events with `sequence_number >= from_sequence`
    /// in order. Restart a partially consumed stream by calling again with
    /// the last seen sequence number plus one.
    fn read_stream(&self, aggregate_id: Uuid, from_sequence: i64) -> EventStream<'_>;

    /// Returns up to `limit` committed events from all streams with a
    /// global position greater than `after_position`, ordered by position.
    ///
    /// Positions follow commit order: an event committed after a reader
    /// advanced past position `p` is always given a position above `p`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn read_all(
        &self,
        after_position: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Loads a single event by its ID.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn load_event(&self, event_id: Uuid) -> Result<Option<StoredEvent>, DomainError>;

    /// Returns the last stored sequence number of a stream (0 if empty).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn current_sequence(&self, aggregate_id: Uuid) -> Result<i64, DomainError>;

    /// Load all events for a given aggregate, ordered by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn load_events(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError> {
        self.read_stream(aggregate_id, 1).try_collect().await
    }
}

/// Checks that a batch belongs to `aggregate_id` and continues the stream
/// at `expected_sequence + 1` without gaps.
///
/// # Errors
///
/// Returns `DomainError::Validation` describing the first offending event.
pub fn validate_batch(
    aggregate_id: Uuid,
    expected_sequence: i64,
    events: &[StoredEvent],
) -> Result<(), DomainError> {
    let mut next = expected_sequence + 1;
    for event in events {
        if event.aggregate_id != aggregate_id {
            return Err(DomainError::Validation(format!(
                "event {} belongs to aggregate {}, not {aggregate_id}",
                event.event_id, event.aggregate_id
            )));
        }
        if event.sequence_number != next {
            return Err(DomainError::Validation(format!(
                "event {} has sequence {}, expected {next}",
                event.event_id, event.sequence_number
            )));
        }
        next += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(aggregate_id: Uuid, sequence_number: i64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: "test".to_owned(),
            event_type: "test.happened".to_owned(),
            payload: serde_json::json!({}),
            schema_version: 1,
            sequence_number,
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            position: 0,
        }
    }

    #[test]
    fn test_validate_batch_accepts_contiguous_sequence() {
        let id = Uuid::new_v4();
        let batch = vec![event(id, 4), event(id, 5)];
        assert!(validate_batch(id, 3, &batch).is_ok());
    }

    #[test]
    fn test_validate_batch_rejects_gap() {
        let id = Uuid::new_v4();
        let batch = vec![event(id, 4), event(id, 6)];
        match validate_batch(id, 3, &batch) {
            Err(DomainError::Validation(msg)) => assert!(msg.contains("expected 5")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_batch_rejects_foreign_aggregate() {
        let id = Uuid::new_v4();
        let batch = vec![event(Uuid::new_v4(), 1)];
        assert!(matches!(
            validate_batch(id, 0, &batch),
            Err(DomainError::Validation(_))
        ));
    }
}
