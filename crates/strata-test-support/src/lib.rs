//! In-memory stores and test utilities for the Strata persistence layer.

mod clock;
mod migration;
mod read_model;
mod repository;
mod saga;
mod snapshot;

pub use clock::{FixedClock, TickingClock};
pub use migration::InMemoryDocumentStore;
pub use read_model::InMemoryReadModelStore;
pub use repository::{FailingEventRepository, InMemoryEventRepository, stored_event};
pub use saga::InMemorySagaRepository;
pub use snapshot::InMemorySnapshotRepository;
