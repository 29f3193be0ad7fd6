//! `PostgreSQL` implementation of the `ReadModelStore` trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use strata_core::error::DomainError;
use strata_core::projection::{ReadModelRecord, ReadModelStore};

use crate::infrastructure;

/// PostgreSQL-backed read-model records and projection checkpoints.
#[derive(Debug, Clone)]
pub struct PgReadModelStore {
    pool: PgPool,
}

impl PgReadModelStore {
    /// Creates a new `PgReadModelStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &PgRow) -> Result<ReadModelRecord, DomainError> {
    let get = |e: sqlx::Error| infrastructure(&e);
    let applied: serde_json::Value = row.try_get("applied").map_err(get)?;
    let applied: BTreeMap<Uuid, i64> = serde_json::from_value(applied).map_err(|e| {
        DomainError::Infrastructure(format!("malformed applied map: {e}"))
    })?;
    Ok(ReadModelRecord {
        projection: row.try_get("projection").map_err(get)?,
        record_id: row.try_get("record_id").map_err(get)?,
        schema_version: row.try_get("schema_version").map_err(get)?,
        body: row.try_get("body").map_err(get)?,
        applied,
    })
}

#[async_trait]
impl ReadModelStore for PgReadModelStore {
    async fn load(
        &self,
        projection: &str,
        record_id: &str,
    ) -> Result<Option<ReadModelRecord>, DomainError> {
        let row = sqlx::query(
            "SELECT projection, record_id, schema_version, body, applied \
             FROM read_models WHERE projection = $1 AND record_id = $2",
        )
        .bind(projection)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn save(&self, record: &ReadModelRecord) -> Result<(), DomainError> {
        let applied = serde_json::to_value(&record.applied)
            .map_err(|e| DomainError::Infrastructure(format!("encoding applied map: {e}")))?;

        sqlx::query(
            "INSERT INTO read_models (projection, record_id, schema_version, body, applied, updated_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (projection, record_id) DO UPDATE \
             SET schema_version = EXCLUDED.schema_version, \
                 body = EXCLUDED.body, \
                 applied = EXCLUDED.applied, \
                 updated_at = NOW()",
        )
        .bind(&record.projection)
        .bind(&record.record_id)
        .bind(record.schema_version)
        .bind(&record.body)
        .bind(applied)
        .execute(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;

        Ok(())
    }

    async fn clear(&self, projection: &str) -> Result<(), DomainError> {
        sqlx::query("DELETE FROM read_models WHERE projection = $1")
            .bind(projection)
            .execute(&self.pool)
            .await
            .map_err(|e| infrastructure(&e))?;
        Ok(())
    }

    async fn checkpoint(&self, subscriber: &str) -> Result<i64, DomainError> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM projection_checkpoints WHERE subscriber = $1")
                .bind(subscriber)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| infrastructure(&e))?;
        Ok(position.unwrap_or(0))
    }

    async fn save_checkpoint(&self, subscriber: &str, position: i64) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO projection_checkpoints (subscriber, position, updated_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (subscriber) DO UPDATE \
             SET position = EXCLUDED.position, updated_at = NOW()",
        )
        .bind(subscriber)
        .bind(position)
        .execute(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;
        Ok(())
    }
}
