//! PostgreSQL-backed stores for the Strata persistence layer.
//!
//! Every store takes a cloned `PgPool` and implements one of the store
//! traits from `strata-core`. The schema lives in the workspace
//! `migrations/` directory.

pub mod pg_event_repository;
pub mod pg_migration_store;
pub mod pg_read_model_store;
pub mod pg_saga_repository;
pub mod pg_snapshot_repository;
pub mod retry;

use strata_core::error::DomainError;

pub use pg_event_repository::PgEventRepository;
pub use pg_migration_store::PgMigrationStore;
pub use pg_read_model_store::PgReadModelStore;
pub use pg_saga_repository::PgSagaRepository;
pub use pg_snapshot_repository::PgSnapshotRepository;
pub use retry::RetryPolicy;

pub(crate) fn infrastructure(error: &sqlx::Error) -> DomainError {
    DomainError::Infrastructure(format!("database error: {error}"))
}
