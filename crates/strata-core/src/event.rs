//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::repository::StoredEvent;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Type name for deserialization routing.
    pub event_type: String,
    /// Aggregate/stream this event belongs to.
    pub aggregate_id: Uuid,
    /// Gap-free, strictly increasing position within the aggregate stream.
    pub sequence_number: i64,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Uuid,
    /// Causation ID linking this event to the event/command that caused it.
    pub causation_id: Uuid,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

impl From<&StoredEvent> for EventMetadata {
    fn from(stored: &StoredEvent) -> Self {
        Self {
            event_id: stored.event_id,
            event_type: stored.event_type.clone(),
            aggregate_id: stored.aggregate_id,
            sequence_number: stored.sequence_number,
            correlation_id: stored.correlation_id,
            causation_id: stored.causation_id,
            occurred_at: stored.occurred_at,
        }
    }
}

/// Trait that all domain events implement.
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    /// Returns the event type name (used for serialization routing).
    fn event_type(&self) -> &'static str;

    /// Serializes the event payload to a JSON document.
    fn to_payload(&self) -> serde_json::Value;

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;
}

/// A domain event made of shared metadata plus a typed payload variant.
///
/// Rehydration decodes the payload through an
/// [`EventRegistry`](crate::registry::EventRegistry) and reassembles the
/// envelope with [`from_parts`](EventEnvelope::from_parts).
pub trait EventEnvelope: DomainEvent + Clone + Sized {
    /// The payload variant type.
    type Kind: Send + Sync;

    /// Reassembles an event from metadata and a decoded payload.
    fn from_parts(metadata: EventMetadata, kind: Self::Kind) -> Self;
}
