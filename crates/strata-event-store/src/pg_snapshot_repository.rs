//! `PostgreSQL` implementation of the `SnapshotRepository` trait.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use strata_core::codec::VersionedDocument;
use strata_core::error::DomainError;
use strata_core::snapshot::{Snapshot, SnapshotRepository};

use crate::infrastructure;

/// PostgreSQL-backed snapshot store.
///
/// A snapshot row is inserted with `completed_at` unset and marked complete
/// by a second statement. `latest` only returns completed rows, so a writer
/// that dies between the two leaves nothing readers can see.
#[derive(Debug, Clone)]
pub struct PgSnapshotRepository {
    pool: PgPool,
}

impl PgSnapshotRepository {
    /// Creates a new `PgSnapshotRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotRepository for PgSnapshotRepository {
    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        let row = sqlx::query(
            "SELECT aggregate_id, aggregate_type, sequence_number, schema_version, state, taken_at \
             FROM snapshots \
             WHERE aggregate_id = $1 AND completed_at IS NOT NULL \
             ORDER BY sequence_number DESC \
             LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;

        row.map(|row| -> Result<Snapshot, sqlx::Error> {
            Ok(Snapshot {
                aggregate_id: row.try_get("aggregate_id")?,
                aggregate_type: row.try_get("aggregate_type")?,
                sequence_number: row.try_get("sequence_number")?,
                state: VersionedDocument {
                    schema_version: row.try_get("schema_version")?,
                    body: row.try_get("state")?,
                },
                taken_at: row.try_get("taken_at")?,
            })
        })
        .transpose()
        .map_err(|e| infrastructure(&e))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        let snapshot_id: Uuid = sqlx::query_scalar(
            "INSERT INTO snapshots \
             (snapshot_id, aggregate_id, aggregate_type, sequence_number, schema_version, state, taken_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (aggregate_id, sequence_number) DO UPDATE \
             SET schema_version = EXCLUDED.schema_version, \
                 state = EXCLUDED.state, \
                 taken_at = EXCLUDED.taken_at, \
                 completed_at = NULL \
             RETURNING snapshot_id",
        )
        .bind(Uuid::now_v7())
        .bind(snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.sequence_number)
        .bind(snapshot.state.schema_version)
        .bind(&snapshot.state.body)
        .bind(snapshot.taken_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;

        sqlx::query("UPDATE snapshots SET completed_at = NOW() WHERE snapshot_id = $1")
            .bind(snapshot_id)
            .execute(&self.pool)
            .await
            .map_err(|e| infrastructure(&e))?;

        Ok(())
    }
}
