//! `PostgreSQL` implementation of the `EventRepository` trait.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use strata_core::bus::EventBus;
use strata_core::error::DomainError;
use strata_core::repository::{EventRepository, EventStream, StoredEvent, validate_batch};

use crate::infrastructure;
use crate::retry::RetryPolicy;

// Held by the reader assigning positions. Appends never take it.
const SEQUENCER_LOCK_KEY: i64 = 0x5354_5241_5441;

const READ_STREAM_SQL: &str = "SELECT position, event_id, aggregate_id, aggregate_type, \
     event_type, payload, schema_version, sequence_number, correlation_id, causation_id, \
     occurred_at FROM events WHERE aggregate_id = $1 AND sequence_number >= $2 \
     ORDER BY sequence_number";

const READ_ALL_SQL: &str = "SELECT position, event_id, aggregate_id, aggregate_type, \
     event_type, payload, schema_version, sequence_number, correlation_id, causation_id, \
     occurred_at FROM events WHERE position > $1 ORDER BY position LIMIT $2";

const LOAD_EVENT_SQL: &str = "SELECT position, event_id, aggregate_id, aggregate_type, \
     event_type, payload, schema_version, sequence_number, correlation_id, causation_id, \
     occurred_at FROM events WHERE event_id = $1";

const STORED_BATCH_SQL: &str = "SELECT position, event_id, aggregate_id, aggregate_type, \
     event_type, payload, schema_version, sequence_number, correlation_id, causation_id, \
     occurred_at FROM events WHERE event_id = ANY($1) ORDER BY sequence_number";

// Rows of in-flight appends are invisible to this statement, so positions
// only ever go to committed events, above every position already visible.
const SEQUENCE_PENDING_SQL: &str = "WITH base AS (SELECT COALESCE(MAX(position), 0) AS last \
     FROM events), pending AS (SELECT insert_id, ROW_NUMBER() OVER (ORDER BY insert_id) AS n \
     FROM events WHERE position IS NULL) \
     UPDATE events SET position = base.last + pending.n FROM base, pending \
     WHERE events.insert_id = pending.insert_id";

/// PostgreSQL-backed event repository.
#[derive(Debug, Clone)]
pub struct PgEventRepository {
    pool: PgPool,
    retry: RetryPolicy,
    bus: Option<EventBus>,
}

impl PgEventRepository {
    /// Creates a new `PgEventRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            bus: None,
        }
    }

    /// Publishes committed events on `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn try_append(
        &self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: &[StoredEvent],
    ) -> Result<Result<Vec<StoredEvent>, DomainError>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let actual: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&mut *tx)
        .await?;

        if actual != expected_sequence {
            drop(tx);
            return self
                .conflict_or_committed(aggregate_id, expected_sequence, events)
                .await;
        }

        for event in events {
            let inserted = sqlx::query(
                "INSERT INTO events (event_id, aggregate_id, aggregate_type, event_type, payload, \
                 schema_version, sequence_number, correlation_id, causation_id, occurred_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(event.event_id)
            .bind(event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.schema_version)
            .bind(event.sequence_number)
            .bind(event.correlation_id)
            .bind(event.causation_id)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    drop(tx);
                    return self
                        .conflict_or_committed(aggregate_id, expected_sequence, events)
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit().await?;
        Ok(Ok(events.to_vec()))
    }

    /// Resolves a failed sequence check. A batch whose event IDs are all
    /// stored was committed by an earlier attempt whose acknowledgement was
    /// lost, so it counts as appended.
    async fn conflict_or_committed(
        &self,
        aggregate_id: Uuid,
        expected_sequence: i64,
        events: &[StoredEvent],
    ) -> Result<Result<Vec<StoredEvent>, DomainError>, sqlx::Error> {
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.event_id).collect();
        let stored = sqlx::query(STORED_BATCH_SQL)
            .bind(&event_ids)
            .fetch_all(&self.pool)
            .await?;
        if stored.len() == events.len() {
            debug!(%aggregate_id, "batch already committed by an earlier attempt");
            return stored.iter().map(event_from_row).collect::<Result<_, _>>().map(Ok);
        }

        let actual = self.read_current_sequence(aggregate_id).await?;
        Ok(Err(DomainError::ConcurrencyConflict {
            aggregate_id,
            expected: expected_sequence,
            actual,
        }))
    }

    /// Assigns positions to committed events that have none yet, unless
    /// another reader is already doing so.
    async fn sequence_pending(&self) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(SEQUENCER_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;
        if !acquired {
            return Ok(0);
        }
        let sequenced = sqlx::query(SEQUENCE_PENDING_SQL)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(sequenced)
    }

    async fn read_page(&self, after_position: i64, limit: i64) -> Result<Vec<PgRow>, sqlx::Error> {
        let sequenced = self.sequence_pending().await?;
        if sequenced > 0 {
            debug!(sequenced, "assigned global positions");
        }
        sqlx::query(READ_ALL_SQL)
            .bind(after_position)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    async fn read_current_sequence(&self, aggregate_id: Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await
    }
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        event_id: row.try_get("event_id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        schema_version: row.try_get("schema_version")?,
        sequence_number: row.try_get("sequence_number")?,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        occurred_at: row.try_get("occurred_at")?,
        position: row.try_get::<Option<i64>, _>("position")?.unwrap_or(0),
    })
}

#[async_trait]
impl EventRepository for PgEventRepository {
    #[instrument(skip(self, events), fields(batch = events.len()))]
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

        let committed = self
            .retry
            .run("append_events", move || {
                self.try_append(aggregate_id, expected_sequence, events)
            })
            .await
            .map_err(|e| infrastructure(&e))?;

        let committed = match committed {
            Ok(committed) => committed,
            Err(e) => {
                warn!(error = %e, "append rejected");
                return Err(e);
            }
        };

        if let Some(bus) = &self.bus {
            bus.publish(&committed);
        }
        let new_sequence = committed
            .last()
            .map_or(expected_sequence, |e| e.sequence_number);
        debug!(new_sequence, "events appended");
        Ok(new_sequence)
    }

    fn read_stream(&self, aggregate_id: Uuid, from_sequence: i64) -> EventStream<'_> {
        sqlx::query(READ_STREAM_SQL)
            .bind(aggregate_id)
            .bind(from_sequence)
            .fetch(&self.pool)
            .map_err(|e| infrastructure(&e))
            .and_then(|row| async move { event_from_row(&row).map_err(|e| infrastructure(&e)) })
            .boxed()
    }

    async fn read_all(
        &self,
        after_position: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .retry
            .run("read_all", move || self.read_page(after_position, limit))
            .await
            .map_err(|e| infrastructure(&e))?;
        rows.iter()
            .map(event_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| infrastructure(&e))
    }

    async fn load_event(&self, event_id: Uuid) -> Result<Option<StoredEvent>, DomainError> {
        let row = self
            .retry
            .run("load_event", move || {
                sqlx::query(LOAD_EVENT_SQL)
                    .bind(event_id)
                    .fetch_optional(&self.pool)
            })
            .await
            .map_err(|e| infrastructure(&e))?;
        row.as_ref()
            .map(event_from_row)
            .transpose()
            .map_err(|e| infrastructure(&e))
    }

    async fn current_sequence(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        self.retry
            .run("current_sequence", move || {
                self.read_current_sequence(aggregate_id)
            })
            .await
            .map_err(|e| infrastructure(&e))
    }
}
