//! A small `Tally` aggregate shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::aggregate::AggregateRoot;
use strata_core::clock::Clock;
use strata_core::codec::{Document, DocumentCodec};
use strata_core::event::{DomainEvent, EventEnvelope, EventMetadata};
use strata_core::migration::{DocumentScope, Migration, MigrationPlan, rename_field};
use strata_core::registry::EventRegistry;
use strata_core::rehydrate::Rehydrator;
use strata_core::repository::EventRepository;
use strata_core::snapshot::{SnapshotPolicy, SnapshotRepository};
use strata_test_support::FixedClock;
use uuid::Uuid;

pub const OPENED: &str = "tally.opened";
pub const ADDED: &str = "tally.added";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opened {
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Added {
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TallyEventKind {
    Opened(Opened),
    Added(Added),
}

#[derive(Debug, Clone)]
pub struct TallyEvent {
    pub metadata: EventMetadata,
    pub kind: TallyEventKind,
}

impl DomainEvent for TallyEvent {
    fn event_type(&self) -> &'static str {
        match self.kind {
            TallyEventKind::Opened(_) => OPENED,
            TallyEventKind::Added(_) => ADDED,
        }
    }

    fn to_payload(&self) -> Value {
        match &self.kind {
            TallyEventKind::Opened(p) => serde_json::to_value(p).unwrap(),
            TallyEventKind::Added(p) => serde_json::to_value(p).unwrap(),
        }
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

impl EventEnvelope for TallyEvent {
    type Kind = TallyEventKind;

    fn from_parts(metadata: EventMetadata, kind: Self::Kind) -> Self {
        Self { metadata, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyState {
    pub label: String,
    pub total: i64,
}

#[derive(Debug)]
pub struct Tally {
    pub id: Uuid,
    pub version: i64,
    pub state: TallyState,
    uncommitted: Vec<TallyEvent>,
}

impl Tally {
    fn next_sequence(&self) -> i64 {
        self.version + i64::try_from(self.uncommitted.len()).unwrap() + 1
    }

    fn record(&mut self, kind: TallyEventKind, event_type: &str, clock: &dyn Clock) {
        let correlation_id = Uuid::new_v4();
        self.uncommitted.push(TallyEvent {
            metadata: EventMetadata {
                event_id: Uuid::new_v4(),
                event_type: event_type.to_owned(),
                aggregate_id: self.id,
                sequence_number: self.next_sequence(),
                correlation_id,
                causation_id: correlation_id,
                occurred_at: clock.now(),
            },
            kind,
        });
    }

    pub fn open(&mut self, label: &str, clock: &dyn Clock) {
        self.record(
            TallyEventKind::Opened(Opened {
                label: label.to_owned(),
            }),
            OPENED,
            clock,
        );
    }

    pub fn add(&mut self, amount: i64, clock: &dyn Clock) {
        self.record(TallyEventKind::Added(Added { amount }), ADDED, clock);
    }
}

impl AggregateRoot for Tally {
    type Event = TallyEvent;
    type State = TallyState;
    const AGGREGATE_TYPE: &'static str = "tally";

    fn empty(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: TallyState {
                label: String::new(),
                total: 0,
            },
            uncommitted: Vec::new(),
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &TallyEvent) {
        match &event.kind {
            TallyEventKind::Opened(p) => self.state.label.clone_from(&p.label),
            TallyEventKind::Added(p) => self.state.total += p.amount,
        }
        self.version = event.metadata.sequence_number;
    }

    fn uncommitted_events(&self) -> &[TallyEvent] {
        &self.uncommitted
    }

    fn clear_uncommitted_events(&mut self) {
        self.uncommitted.clear();
    }

    fn state(&self) -> TallyState {
        self.state.clone()
    }

    fn restore(id: Uuid, version: i64, state: TallyState) -> Self {
        Self {
            id,
            version,
            state,
            uncommitted: Vec::new(),
        }
    }
}

/// `tally.added` v1 stored the amount under `amt`.
pub fn rename_amt(mut doc: Document) -> Result<Document, String> {
    rename_field(&mut doc, "amt", "amount");
    Ok(doc)
}

pub fn added_plan() -> MigrationPlan {
    MigrationPlan::new(
        DocumentScope::events(ADDED),
        vec![Migration {
            version: 2,
            description: "rename amt to amount",
            apply: rename_amt,
        }],
    )
    .unwrap()
}

pub fn registry() -> EventRegistry<TallyEventKind> {
    EventRegistry::new()
        .register(
            OPENED,
            MigrationPlan::initial(DocumentScope::events(OPENED)),
            |doc| serde_json::from_value(doc).map(TallyEventKind::Opened),
        )
        .register(ADDED, added_plan(), |doc| {
            serde_json::from_value(doc).map(TallyEventKind::Added)
        })
}

pub fn codec() -> DocumentCodec<TallyState> {
    DocumentCodec::new(MigrationPlan::initial(DocumentScope::snapshots(
        Tally::AGGREGATE_TYPE,
    )))
}

pub fn rehydrator(
    events: Arc<dyn EventRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
    policy: SnapshotPolicy,
) -> Rehydrator<Tally> {
    Rehydrator::new(
        events,
        snapshots,
        Arc::new(registry()),
        Arc::new(codec()),
        Arc::new(FixedClock::new_year()),
    )
    .with_policy(policy)
}
