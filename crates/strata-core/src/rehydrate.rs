//! Aggregate rehydration and commit.
//!
//! [`Rehydrator`] rebuilds an aggregate from its latest usable snapshot plus
//! the events recorded after it, and persists the events a command handler
//! produced. Loading never writes: old payloads and snapshots are upgraded in
//! memory only.

use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::aggregate::{AggregateRoot, KindOf};
use crate::clock::Clock;
use crate::codec::DocumentCodec;
use crate::error::DomainError;
use crate::event::{DomainEvent, EventEnvelope, EventMetadata};
use crate::registry::EventRegistry;
use crate::repository::{EventRepository, StoredEvent};
use crate::snapshot::{Snapshot, SnapshotPolicy, SnapshotRepository};

/// Loads and commits aggregates of type `A`.
pub struct Rehydrator<A: AggregateRoot> {
    events: Arc<dyn EventRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
    registry: Arc<EventRegistry<KindOf<A>>>,
    codec: Arc<DocumentCodec<A::State>>,
    clock: Arc<dyn Clock>,
    policy: SnapshotPolicy,
}

impl<A: AggregateRoot> Clone for Rehydrator<A> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            snapshots: Arc::clone(&self.snapshots),
            registry: Arc::clone(&self.registry),
            codec: Arc::clone(&self.codec),
            clock: Arc::clone(&self.clock),
            policy: self.policy,
        }
    }
}

impl<A: AggregateRoot> Rehydrator<A> {
    /// Creates a rehydrator with the default snapshot policy.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventRepository>,
        snapshots: Arc<dyn SnapshotRepository>,
        registry: Arc<EventRegistry<KindOf<A>>>,
        codec: Arc<DocumentCodec<A::State>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            snapshots,
            registry,
            codec,
            clock,
            policy: SnapshotPolicy::default(),
        }
    }

    /// Replaces the snapshot policy.
    #[must_use]
    pub fn with_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the underlying event repository.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventRepository> {
        &self.events
    }

    /// Loads an existing aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the aggregate has no
    /// events, and any error raised while reading or decoding its stream.
    pub async fn load(&self, aggregate_id: Uuid) -> Result<A, DomainError> {
        let aggregate = self.load_or_empty(aggregate_id).await?;
        if aggregate.version() == 0 {
            return Err(DomainError::AggregateNotFound(aggregate_id));
        }
        Ok(aggregate)
    }

    /// Loads an aggregate, returning an empty one if it has no history.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownEventType` or
    /// `DomainError::UnsupportedSchema` if a stored event cannot be decoded,
    /// and `DomainError::Infrastructure` for store failures.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE))]
    pub async fn load_or_empty(&self, aggregate_id: Uuid) -> Result<A, DomainError> {
        let mut aggregate = self.restore_from_snapshot(aggregate_id).await;
        let mut stream = self.events.read_stream(aggregate_id, aggregate.version() + 1);
        let mut replayed = 0_usize;
        while let Some(stored) = stream.try_next().await? {
            let event = self.decode_event(&stored)?;
            aggregate.apply(&event);
            replayed += 1;
        }
        debug!(version = aggregate.version(), replayed, "aggregate rehydrated");
        Ok(aggregate)
    }

    /// Decodes a stored event into the aggregate's event type, upgrading
    /// its payload if it was written with an older schema.
    ///
    /// # Errors
    ///
    /// Returns the registry's decode error.
    pub fn decode_event(&self, stored: &StoredEvent) -> Result<A::Event, DomainError> {
        let kind = self.registry.decode(
            &stored.event_type,
            stored.schema_version,
            stored.payload.clone(),
        )?;
        Ok(A::Event::from_parts(EventMetadata::from(stored), kind))
    }

    /// Appends the aggregate's uncommitted events, applies them and takes a
    /// snapshot if the commit crossed the policy threshold.
    ///
    /// Returns the events as stored. On error the aggregate is left
    /// untouched and should be discarded.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the stream moved since
    /// the aggregate was loaded, `DomainError::UnknownEventType` if an event
    /// type is not registered, and `DomainError::Infrastructure` for store
    /// failures.
    #[instrument(
        skip(self, aggregate),
        fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %aggregate.aggregate_id())
    )]
    pub async fn commit(&self, aggregate: &mut A) -> Result<Vec<StoredEvent>, DomainError> {
        let pending: Vec<A::Event> = aggregate.uncommitted_events().to_vec();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let stored = pending
            .iter()
            .map(|event| self.to_stored_event(event))
            .collect::<Result<Vec<_>, _>>()?;

        let previous = aggregate.version();
        let current = self
            .events
            .append_events(aggregate.aggregate_id(), previous, &stored)
            .await?;

        for event in &pending {
            aggregate.apply(event);
        }
        aggregate.clear_uncommitted_events();

        if self.policy.should_snapshot(previous, current) {
            self.take_snapshot(aggregate).await;
        }

        Ok(stored)
    }

    async fn restore_from_snapshot(&self, aggregate_id: Uuid) -> A {
        let snapshot = match self.snapshots.latest(aggregate_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return A::empty(aggregate_id),
            Err(e) => {
                warn!(%aggregate_id, error = %e, "snapshot lookup failed; replaying full stream");
                return A::empty(aggregate_id);
            }
        };
        let sequence_number = snapshot.sequence_number;
        match self.codec.decode(snapshot.state) {
            Ok(state) => A::restore(aggregate_id, sequence_number, state),
            Err(e) => {
                warn!(%aggregate_id, error = %e, "snapshot unusable; replaying full stream");
                A::empty(aggregate_id)
            }
        }
    }

    async fn take_snapshot(&self, aggregate: &A) {
        let state = match self.codec.encode(&aggregate.state()) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "snapshot encoding failed");
                return;
            }
        };
        let snapshot = Snapshot {
            aggregate_id: aggregate.aggregate_id(),
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            sequence_number: aggregate.version(),
            state,
            taken_at: self.clock.now(),
        };
        match self.snapshots.save(&snapshot).await {
            Ok(()) => debug!(sequence_number = snapshot.sequence_number, "snapshot taken"),
            Err(e) => warn!(error = %e, "snapshot save failed"),
        }
    }

    fn to_stored_event(&self, event: &A::Event) -> Result<StoredEvent, DomainError> {
        let meta = event.metadata();
        Ok(StoredEvent {
            event_id: meta.event_id,
            aggregate_id: meta.aggregate_id,
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            event_type: event.event_type().to_owned(),
            payload: event.to_payload(),
            schema_version: self.registry.current_version(event.event_type())?,
            sequence_number: meta.sequence_number,
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            occurred_at: meta.occurred_at,
            position: 0,
        })
    }
}
