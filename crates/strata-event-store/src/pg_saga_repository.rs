//! `PostgreSQL` implementation of the `SagaRepository` trait.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use strata_core::error::DomainError;
use strata_core::saga::{SagaInstance, SagaRepository, SagaStatus, StepLog};

use crate::infrastructure;

/// PostgreSQL-backed saga instances.
#[derive(Debug, Clone)]
pub struct PgSagaRepository {
    pool: PgPool,
}

impl PgSagaRepository {
    /// Creates a new `PgSagaRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_SAGA_SQL: &str = "SELECT saga_id, saga_type, status, current_step, steps, \
     correlated_aggregate_ids, failure_reason, started_at, updated_at FROM sagas";

fn encode_steps(instance: &SagaInstance) -> Result<(serde_json::Value, i32), DomainError> {
    let steps = serde_json::to_value(&instance.steps)
        .map_err(|e| DomainError::Infrastructure(format!("encoding saga steps: {e}")))?;
    let current_step = i32::try_from(instance.current_step).map_err(|_| {
        DomainError::Validation(format!("step index {} out of range", instance.current_step))
    })?;
    Ok((steps, current_step))
}

fn instance_from_row(row: &PgRow) -> Result<SagaInstance, DomainError> {
    let get = |e: sqlx::Error| infrastructure(&e);
    let status: String = row.try_get("status").map_err(get)?;
    let current_step: i32 = row.try_get("current_step").map_err(get)?;
    let steps: serde_json::Value = row.try_get("steps").map_err(get)?;
    let steps: Vec<StepLog> = serde_json::from_value(steps)
        .map_err(|e| DomainError::Infrastructure(format!("malformed saga steps: {e}")))?;

    Ok(SagaInstance {
        saga_id: row.try_get("saga_id").map_err(get)?,
        saga_type: row.try_get("saga_type").map_err(get)?,
        status: status.parse()?,
        current_step: usize::try_from(current_step)
            .map_err(|_| DomainError::Infrastructure(format!("negative step {current_step}")))?,
        steps,
        correlated_aggregate_ids: row.try_get("correlated_aggregate_ids").map_err(get)?,
        failure_reason: row.try_get("failure_reason").map_err(get)?,
        started_at: row.try_get("started_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

#[async_trait]
impl SagaRepository for PgSagaRepository {
    async fn insert(&self, instance: &SagaInstance) -> Result<bool, DomainError> {
        let (steps, current_step) = encode_steps(instance)?;

        let inserted = sqlx::query(
            "INSERT INTO sagas (saga_id, saga_type, status, current_step, steps, \
             correlated_aggregate_ids, failure_reason, started_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (saga_id) DO NOTHING",
        )
        .bind(instance.saga_id)
        .bind(&instance.saga_type)
        .bind(instance.status.as_str())
        .bind(current_step)
        .bind(steps)
        .bind(&instance.correlated_aggregate_ids)
        .bind(&instance.failure_reason)
        .bind(instance.started_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn save(&self, instance: &SagaInstance) -> Result<(), DomainError> {
        let (steps, current_step) = encode_steps(instance)?;

        sqlx::query(
            "INSERT INTO sagas (saga_id, saga_type, status, current_step, steps, \
             correlated_aggregate_ids, failure_reason, started_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (saga_id) DO UPDATE \
             SET status = EXCLUDED.status, \
                 current_step = EXCLUDED.current_step, \
                 steps = EXCLUDED.steps, \
                 correlated_aggregate_ids = EXCLUDED.correlated_aggregate_ids, \
                 failure_reason = EXCLUDED.failure_reason, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(instance.saga_id)
        .bind(&instance.saga_type)
        .bind(instance.status.as_str())
        .bind(current_step)
        .bind(steps)
        .bind(&instance.correlated_aggregate_ids)
        .bind(&instance.failure_reason)
        .bind(instance.started_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;

        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> Result<Option<SagaInstance>, DomainError> {
        let row = sqlx::query(&format!("{SELECT_SAGA_SQL} WHERE saga_id = $1"))
            .bind(saga_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| infrastructure(&e))?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn delete(&self, saga_id: Uuid) -> Result<(), DomainError> {
        sqlx::query("DELETE FROM sagas WHERE saga_id = $1")
            .bind(saga_id)
            .execute(&self.pool)
            .await
            .map_err(|e| infrastructure(&e))?;
        Ok(())
    }

    async fn list_unfinished(&self, saga_type: &str) -> Result<Vec<SagaInstance>, DomainError> {
        let rows = sqlx::query(&format!(
            "{SELECT_SAGA_SQL} WHERE saga_type = $1 AND status IN ($2, $3) ORDER BY started_at"
        ))
        .bind(saga_type)
        .bind(SagaStatus::Running.as_str())
        .bind(SagaStatus::Compensating.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| infrastructure(&e))?;

        rows.iter().map(instance_from_row).collect()
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
