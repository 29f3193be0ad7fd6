//! Error types for the domain, migration and saga layers.

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// Optimistic concurrency conflict. The caller must re-read and retry.
    #[error(
        "concurrency conflict on aggregate {aggregate_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The sequence number the caller expected to be current.
        expected: i64,
        /// The sequence number actually stored.
        actual: i64,
    },

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A stored document carries a schema version newer than this build
    /// understands.
    #[error("unsupported schema for {kind}: version {found} is newer than supported version {supported}")]
    UnsupportedSchema {
        /// Event type, aggregate type or projection name of the document.
        kind: String,
        /// The version found on the document.
        found: i32,
        /// The newest version this build can decode.
        supported: i32,
    },

    /// A stored event has a type no decoder is registered for.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` if the caller may re-read state and resubmit.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Errors raised by the migration engine and its stores.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration plan is malformed (duplicate or non-contiguous versions).
    #[error("invalid migration plan for {scope}: {reason}")]
    InvalidPlan {
        /// Scope the plan targets.
        scope: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A migration version was requested that the plan does not contain.
    #[error("migration {version} not found for {scope}")]
    NotFound {
        /// Scope the plan targets.
        scope: String,
        /// The missing version.
        version: i32,
    },

    /// A document could not be transformed. The migration was rolled back.
    #[error("migration {version} for {scope} failed on document {document_id}: {reason}")]
    Transform {
        /// Scope the plan targets.
        scope: String,
        /// The migration that failed.
        version: i32,
        /// Identifier of the offending document.
        document_id: String,
        /// Transformation error message.
        reason: String,
    },

    /// The ledger entry could not be recorded. Fatal: the run halts.
    #[error("ledger write failed for {scope} migration {version}: {reason}")]
    LedgerWriteFailure {
        /// Scope the plan targets.
        scope: String,
        /// The migration whose ledger entry was lost.
        version: i32,
        /// Underlying store error.
        reason: String,
    },

    /// Any other store failure.
    #[error("migration store error: {0}")]
    Store(String),
}

/// Errors raised by the saga coordinator.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A step did not observe its confirming event in time.
    #[error("saga {saga_id} timed out after {timeout_ms}ms waiting on step {step}")]
    Timeout {
        /// The saga instance.
        saga_id: Uuid,
        /// The step that timed out.
        step: String,
        /// The configured step timeout.
        timeout_ms: u64,
    },

    /// One or more compensations failed. The saga is parked in `Failed`
    /// and needs manual intervention.
    #[error("saga {saga_id} compensation failed for steps {failed_steps:?} (original failure: {reason})")]
    CompensationFailure {
        /// The saga instance.
        saga_id: Uuid,
        /// Steps whose compensation failed, in the order attempted.
        failed_steps: Vec<String>,
        /// Why compensation was started.
        reason: String,
    },

    /// A saga with this identifier already exists.
    #[error("saga {0} already started")]
    AlreadyStarted(Uuid),

    /// A domain or persistence error.
    #[error(transparent)]
    Domain(#[from] DomainError),
}
