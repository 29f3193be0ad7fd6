//! Aggregate root abstraction.

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::event::EventEnvelope;

/// Trait for aggregate roots that reconstitute from event history.
///
/// `apply` is the aggregate's pure transition function: it must not read
/// clocks, random sources or any other ambient state, so that replaying the
/// same stream always yields the same aggregate.
pub trait AggregateRoot: Send + Sync + Sized {
    /// The event type this aggregate produces and consumes.
    type Event: EventEnvelope;

    /// Serializable form of the aggregate's state, used for snapshots.
    type State: Serialize + DeserializeOwned + Send + Sync;

    /// Stable type name, recorded on every stored event and snapshot.
    const AGGREGATE_TYPE: &'static str;

    /// Creates an aggregate with no history.
    fn empty(id: Uuid) -> Self;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid;

    /// Returns the sequence number of the last applied event (0 if none).
    fn version(&self) -> i64;

    /// Apply an event to mutate internal state (used during reconstitution).
    fn apply(&mut self, event: &Self::Event);

    /// Returns uncommitted events produced by command handling.
    fn uncommitted_events(&self) -> &[Self::Event];

    /// Clears uncommitted events after persistence.
    fn clear_uncommitted_events(&mut self);

    /// Captures the current state for a snapshot.
    fn state(&self) -> Self::State;

    /// Rebuilds an aggregate from a snapshot taken at `version`.
    fn restore(id: Uuid, version: i64, state: Self::State) -> Self;
}

/// Payload variant type of an aggregate's events.
pub type KindOf<A> = <<A as AggregateRoot>::Event as EventEnvelope>::Kind;
