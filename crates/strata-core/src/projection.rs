//! Read-model projection.
//!
//! A [`Projection`] folds committed events into denormalized JSON records.
//! The [`Projector`] feeds it every event in global position order,
//! checkpointing after each one. Delivery is at least once: every record
//! remembers the last sequence number it absorbed per source aggregate, so
//! a redelivered event is recognised and skipped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::codec::Document;
use crate::error::DomainError;
use crate::migration::MigrationPlan;
use crate::repository::{EventRepository, StoredEvent};

/// A read-model record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadModelRecord {
    /// Name of the owning projection.
    pub projection: String,
    /// Record key within the projection.
    pub record_id: String,
    /// Schema version of `body`.
    pub schema_version: i32,
    /// The denormalized document.
    pub body: Document,
    /// Last sequence number absorbed, per source aggregate.
    pub applied: BTreeMap<Uuid, i64>,
}

impl ReadModelRecord {
    /// Returns `true` if this record already absorbed `event`.
    #[must_use]
    pub fn has_applied(&self, event: &StoredEvent) -> bool {
        self.applied
            .get(&event.aggregate_id)
            .is_some_and(|&seq| seq >= event.sequence_number)
    }
}

/// Persistence for read-model records and subscriber checkpoints.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    /// Loads a record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn load(
        &self,
        projection: &str,
        record_id: &str,
    ) -> Result<Option<ReadModelRecord>, DomainError>;

    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn save(&self, record: &ReadModelRecord) -> Result<(), DomainError>;

    /// Deletes every record of a projection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn clear(&self, projection: &str) -> Result<(), DomainError>;

    /// Returns the last global position a subscriber processed (0 if none).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn checkpoint(&self, subscriber: &str) -> Result<i64, DomainError>;

    /// Records the last global position a subscriber processed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    async fn save_checkpoint(&self, subscriber: &str, position: i64) -> Result<(), DomainError>;
}

/// A fold from events into read-model records.
pub trait Projection: Send + Sync {
    /// Stable projection name. Also used as the checkpoint subscriber name.
    fn name(&self) -> &'static str;

    /// Schema history of this projection's record bodies.
    fn plan(&self) -> &MigrationPlan;

    /// Keys of the records `event` affects. Irrelevant events map to none.
    fn record_ids(&self, event: &StoredEvent) -> Vec<String>;

    /// Body of a record that does not exist yet.
    fn initial_body(&self, _record_id: &str) -> Document {
        Document::Object(serde_json::Map::new())
    }

    /// Folds `event` into a record body.
    ///
    /// # Errors
    ///
    /// Returns a `DomainError` if the event cannot be decoded or applied.
    fn apply(&self, body: &mut Document, event: &StoredEvent) -> Result<(), DomainError>;
}

/// Drives a projection from the event store.
pub struct Projector<P: Projection> {
    projection: P,
    events: Arc<dyn EventRepository>,
    store: Arc<dyn ReadModelStore>,
    batch_size: usize,
    // Serializes catch-up and rebuild so checkpoints advance monotonically.
    lock: Mutex<()>,
}

impl<P: Projection> Projector<P> {
    /// Creates a projector reading up to 256 events per batch.
    #[must_use]
    pub fn new(
        projection: P,
        events: Arc<dyn EventRepository>,
        store: Arc<dyn ReadModelStore>,
    ) -> Self {
        Self {
            projection,
            events,
            store,
            batch_size: 256,
            lock: Mutex::new(()),
        }
    }

    /// Overrides the read batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Returns the projection.
    #[must_use]
    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Reads one record of this projection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for store failures.
    pub async fn record(&self, record_id: &str) -> Result<Option<ReadModelRecord>, DomainError> {
        self.store.load(self.projection.name(), record_id).await
    }

    /// Folds one event into every record it affects.
    ///
    /// Records that already absorbed the event are left unchanged. Returns
    /// the number of records written.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the projection or the store.
    pub async fn apply_event(&self, event: &StoredEvent) -> Result<usize, DomainError> {
        let name = self.projection.name();
        let plan = self.projection.plan();
        let mut written = 0;

        for record_id in self.projection.record_ids(event) {
            let mut record = match self.store.load(name, &record_id).await? {
                Some(record) => record,
                None => ReadModelRecord {
                    projection: name.to_owned(),
                    body: self.projection.initial_body(&record_id),
                    record_id,
                    schema_version: plan.latest_version(),
                    applied: BTreeMap::new(),
                },
            };

            if record.has_applied(event) {
                debug!(
                    record_id = %record.record_id,
                    event_id = %event.event_id,
                    "event already projected"
                );
                continue;
            }

            if record.schema_version < plan.latest_version() {
                record.body = plan.upgrade(record.body, record.schema_version)?;
                record.schema_version = plan.latest_version();
            }

            self.projection.apply(&mut record.body, event)?;
            record.applied.insert(event.aggregate_id, event.sequence_number);
            self.store.save(&record).await?;
            written += 1;
        }

        Ok(written)
    }

    /// Applies every event committed after the checkpoint.
    ///
    /// Returns the number of events processed.
    ///
    /// # Errors
    ///
    /// Returns the first error raised. The checkpoint stays at the last
    /// event fully applied.
    #[instrument(skip(self), fields(projection = self.projection.name()))]
    pub async fn catch_up(&self) -> Result<usize, DomainError> {
        let _guard = self.lock.lock().await;
        self.catch_up_locked().await
    }

    /// Deletes the projection's records and replays the whole event log.
    ///
    /// # Errors
    ///
    /// Returns the first error raised.
    #[instrument(skip(self), fields(projection = self.projection.name()))]
    pub async fn rebuild(&self) -> Result<usize, DomainError> {
        let _guard = self.lock.lock().await;
        let name = self.projection.name();
        self.store.clear(name).await?;
        self.store.save_checkpoint(name, 0).await?;
        let processed = self.catch_up_locked().await?;
        info!(processed, "projection rebuilt");
        Ok(processed)
    }

    /// Keeps the projection current until `shutdown` turns `true`.
    ///
    /// Catches up whenever an event is published on `bus` and at least every
    /// `poll_interval`, so events committed by other processes are picked up
    /// too. A zero interval is raised to one millisecond. Errors are logged
    /// and retried on the next wake-up.
    pub async fn run(
        &self,
        bus: &EventBus,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut notifications = bus.subscribe();
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        info!(projection = self.projection.name(), "projector started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = notifications.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = received {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.catch_up().await {
                error!(
                    projection = self.projection.name(),
                    error = %e,
                    "projection catch-up failed"
                );
            }
        }

        info!(projection = self.projection.name(), "projector stopped");
    }

    async fn catch_up_locked(&self) -> Result<usize, DomainError> {
        let name = self.projection.name();
        let mut position = self.store.checkpoint(name).await?;
        let mut processed = 0;

        loop {
            let batch = self.events.read_all(position, self.batch_size).await?;
            for event in &batch {
                self.apply_event(event).await?;
                position = event.position;
                self.store.save_checkpoint(name, position).await?;
                processed += 1;
            }
            if batch.len() < self.batch_size {
                break;
            }
        }

        if processed > 0 {
            debug!(processed, position, "projection caught up");
        }
        Ok(processed)
    }
}
