//! `PostgreSQL` implementation of the `MigrationStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use strata_core::codec::VersionedDocument;
use strata_core::error::MigrationError;
use strata_core::migration::{
    ApplyOutcome, Collection, DocumentScope, LedgerEntry, LedgerStatus, MigrationPlan,
    MigrationStore,
};

/// Where the documents of a collection live.
struct Target {
    table: &'static str,
    id: &'static str,
    kind: &'static str,
    body: &'static str,
}

const fn target(collection: Collection) -> Target {
    match collection {
        Collection::Events => Target {
            table: "events",
            id: "event_id",
            kind: "event_type",
            body: "payload",
        },
        Collection::Snapshots => Target {
            table: "snapshots",
            id: "snapshot_id",
            kind: "aggregate_type",
            body: "state",
        },
        Collection::ReadModels => Target {
            table: "read_models",
            id: "record_id",
            kind: "projection",
            body: "body",
        },
    }
}

fn store_error(error: &sqlx::Error) -> MigrationError {
    MigrationError::Store(error.to_string())
}

/// Applies document migrations and keeps the ledger in `migrations_ledger`.
///
/// Each migration runs in one transaction that holds an advisory lock on
/// its scope and an exclusive lock on the collection's table, so concurrent
/// runners and writers are excluded until the ledger entry commits.
#[derive(Debug, Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    /// Creates a new `PgMigrationStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate_documents(
        tx: &mut Transaction<'static, Postgres>,
        plan: &MigrationPlan,
        version: i32,
    ) -> Result<u64, MigrationError> {
        let scope = plan.scope();
        let target = target(scope.collection);

        sqlx::query(&format!("LOCK TABLE {} IN EXCLUSIVE MODE", target.table))
            .execute(&mut **tx)
            .await
            .map_err(|e| store_error(&e))?;

        let rows = sqlx::query(&format!(
            "SELECT {id}::text AS document_id, schema_version, {body} AS body \
             FROM {table} WHERE {kind} = $1 AND schema_version < $2 \
             ORDER BY {id} FOR UPDATE",
            id = target.id,
            body = target.body,
            table = target.table,
            kind = target.kind,
        ))
        .bind(&scope.kind)
        .bind(version)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| store_error(&e))?;

        let update = format!(
            "UPDATE {table} SET {body} = $1, schema_version = $2 \
             WHERE {kind} = $3 AND {id}::text = $4",
            table = target.table,
            body = target.body,
            kind = target.kind,
            id = target.id,
        );

        let mut changed = 0_u64;
        for row in rows {
            let document_id: String = row.try_get("document_id").map_err(|e| store_error(&e))?;
            let document = VersionedDocument {
                schema_version: row.try_get("schema_version").map_err(|e| store_error(&e))?,
                body: row.try_get("body").map_err(|e| store_error(&e))?,
            };
            let Some(migrated) = plan.migrate_document(version, &document_id, document)? else {
                continue;
            };
            sqlx::query(&update)
                .bind(&migrated.body)
                .bind(migrated.schema_version)
                .bind(&scope.kind)
                .bind(&document_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| store_error(&e))?;
            changed += 1;
        }
        Ok(changed)
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn ledger(&self, scope: &DocumentScope) -> Result<Vec<LedgerEntry>, MigrationError> {
        let rows = sqlx::query(
            "SELECT version, description, applied_at, status FROM migrations_ledger \
             WHERE collection = $1 AND kind = $2 ORDER BY version",
        )
        .bind(scope.collection.as_str())
        .bind(&scope.kind)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error(&e))?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(|e| store_error(&e))?;
                if status != LedgerStatus::Applied.as_str() {
                    return Err(MigrationError::Store(format!(
                        "unknown ledger status `{status}`"
                    )));
                }
                Ok(LedgerEntry {
                    scope: scope.clone(),
                    version: row.try_get("version").map_err(|e| store_error(&e))?,
                    description: row.try_get("description").map_err(|e| store_error(&e))?,
                    applied_at: row.try_get("applied_at").map_err(|e| store_error(&e))?,
                    status: LedgerStatus::Applied,
                })
            })
            .collect()
    }

    async fn apply_migration(
        &self,
        plan: &MigrationPlan,
        version: i32,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, MigrationError> {
        let migration = plan.migration(version)?;
        let scope = plan.scope();
        let mut tx = self.pool.begin().await.map_err(|e| store_error(&e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(scope.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error(&e))?;

        let recorded: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM migrations_ledger \
             WHERE collection = $1 AND kind = $2 AND version = $3)",
        )
        .bind(scope.collection.as_str())
        .bind(&scope.kind)
        .bind(version)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| store_error(&e))?;
        if recorded {
            debug!(%scope, version, "migration recorded by another runner");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let documents_changed = Self::migrate_documents(&mut tx, plan, version).await?;

        let ledger_failure = |e: &sqlx::Error| MigrationError::LedgerWriteFailure {
            scope: scope.to_string(),
            version,
            reason: e.to_string(),
        };

        sqlx::query(
            "INSERT INTO migrations_ledger (collection, kind, version, description, applied_at, status) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(scope.collection.as_str())
        .bind(&scope.kind)
        .bind(version)
        .bind(migration.description)
        .bind(applied_at)
        .bind(LedgerStatus::Applied.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| ledger_failure(&e))?;

        tx.commit().await.map_err(|e| ledger_failure(&e))?;

        Ok(ApplyOutcome::Applied { documents_changed })
    }
}
