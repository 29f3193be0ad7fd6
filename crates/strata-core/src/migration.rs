//! Versioned document migrations.
//!
//! Every persisted document belongs to a [`DocumentScope`]: a collection
//! plus the kind of document in it (an event type, aggregate type or
//! projection name). A scope's schema history is a [`MigrationPlan`]: an
//! ordered chain of [`Migration`]s, version 2 upwards, each transforming a
//! document from the previous version. Version 1 is the initial shape.
//!
//! The same chain serves two purposes:
//!
//! - the [`DocumentCodec`](crate::codec::DocumentCodec) upgrades old
//!   documents in memory on read, and
//! - the [`MigrationEngine`] rewrites stored documents in place, recording
//!   each applied version in the migrations ledger.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::clock::Clock;
use crate::codec::{Document, VersionedDocument};
use crate::error::{DomainError, MigrationError};

/// Persisted collections that hold versioned documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Event payloads, keyed by event type.
    Events,
    /// Aggregate snapshots, keyed by aggregate type.
    Snapshots,
    /// Read-model records, keyed by projection name.
    ReadModels,
}

impl Collection {
    /// Returns the collection's stable name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Snapshots => "snapshots",
            Self::ReadModels => "read_models",
        }
    }
}

/// A kind of document within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentScope {
    /// The collection holding the documents.
    pub collection: Collection,
    /// Event type, aggregate type or projection name.
    pub kind: String,
}

impl DocumentScope {
    /// Scope of the payloads of one event type.
    #[must_use]
    pub fn events(event_type: &str) -> Self {
        Self {
            collection: Collection::Events,
            kind: event_type.to_owned(),
        }
    }

    /// Scope of the snapshots of one aggregate type.
    #[must_use]
    pub fn snapshots(aggregate_type: &str) -> Self {
        Self {
            collection: Collection::Snapshots,
            kind: aggregate_type.to_owned(),
        }
    }

    /// Scope of the records of one projection.
    #[must_use]
    pub fn read_models(projection: &str) -> Self {
        Self {
            collection: Collection::ReadModels,
            kind: projection.to_owned(),
        }
    }
}

impl fmt::Display for DocumentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection.as_str(), self.kind)
    }
}

/// A document transformation from version `n - 1` to version `n`.
pub type Transform = fn(Document) -> Result<Document, String>;

/// One step of a scope's schema history.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// The schema version this migration produces.
    pub version: i32,
    /// Human-readable summary, recorded in the ledger.
    pub description: &'static str,
    /// The transformation.
    pub apply: Transform,
}

/// The ordered schema history of one document scope.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    scope: DocumentScope,
    migrations: Vec<Migration>,
}

impl MigrationPlan {
    /// Builds a plan, sorting migrations by version.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidPlan` unless the versions are exactly
    /// `2, 3, ..., n`.
    pub fn new(
        scope: DocumentScope,
        mut migrations: Vec<Migration>,
    ) -> Result<Self, MigrationError> {
        migrations.sort_by_key(|m| m.version);
        for (expected, migration) in (2..).zip(&migrations) {
            if migration.version != expected {
                return Err(MigrationError::InvalidPlan {
                    scope: scope.to_string(),
                    reason: format!(
                        "expected version {expected}, found {}",
                        migration.version
                    ),
                });
            }
        }
        Ok(Self { scope, migrations })
    }

    /// A plan for a scope still at its initial version.
    #[must_use]
    pub fn initial(scope: DocumentScope) -> Self {
        Self {
            scope,
            migrations: Vec::new(),
        }
    }

    /// Returns the scope this plan applies to.
    #[must_use]
    pub fn scope(&self) -> &DocumentScope {
        &self.scope
    }

    /// Returns the migrations in version order.
    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// The version newly written documents carry.
    #[must_use]
    pub fn latest_version(&self) -> i32 {
        self.migrations.last().map_or(1, |m| m.version)
    }

    /// Looks up a migration by version.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::NotFound` if the plan has no such version.
    pub fn migration(&self, version: i32) -> Result<&Migration, MigrationError> {
        self.migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| MigrationError::NotFound {
                scope: self.scope.to_string(),
                version,
            })
    }

    /// Upgrades a document written at `from_version` to the latest version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnsupportedSchema` if `from_version` is newer
    /// than the plan, `DomainError::Validation` if it is below 1, and
    /// `DomainError::Infrastructure` if a transformation fails.
    pub fn upgrade(&self, document: Document, from_version: i32) -> Result<Document, DomainError> {
        let latest = self.latest_version();
        if from_version > latest {
            return Err(DomainError::UnsupportedSchema {
                kind: self.scope.kind.clone(),
                found: from_version,
                supported: latest,
            });
        }
        if from_version < 1 {
            return Err(DomainError::Validation(format!(
                "{} document has invalid schema version {from_version}",
                self.scope
            )));
        }
        self.upgrade_between(document, from_version, latest)
            .map_err(|(version, reason)| {
                DomainError::Infrastructure(format!(
                    "upgrading {} document to v{version} failed: {reason}",
                    self.scope
                ))
            })
    }

    /// Brings one stored document up to `target_version`.
    ///
    /// Returns `Ok(None)` when the document is already at or beyond the
    /// target, which makes re-application a no-op.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::NotFound` if the plan does not reach
    /// `target_version`, or `MigrationError::Transform` if a step fails.
    pub fn migrate_document(
        &self,
        target_version: i32,
        document_id: &str,
        document: VersionedDocument,
    ) -> Result<Option<VersionedDocument>, MigrationError> {
        self.migration(target_version)?;
        if document.schema_version >= target_version {
            return Ok(None);
        }
        let body = self
            .upgrade_between(document.body, document.schema_version.max(1), target_version)
            .map_err(|(version, reason)| MigrationError::Transform {
                scope: self.scope.to_string(),
                version,
                document_id: document_id.to_owned(),
                reason,
            })?;
        Ok(Some(VersionedDocument {
            schema_version: target_version,
            body,
        }))
    }

    fn upgrade_between(
        &self,
        mut document: Document,
        from_version: i32,
        to_version: i32,
    ) -> Result<Document, (i32, String)> {
        for migration in self
            .migrations
            .iter()
            .filter(|m| m.version > from_version && m.version <= to_version)
        {
            document = (migration.apply)(document).map_err(|e| (migration.version, e))?;
        }
        Ok(document)
    }
}

/// Renames a top-level field of an object document.
///
/// Returns `true` if the field was present. Documents that already carry
/// `to` are left untouched.
pub fn rename_field(document: &mut Document, from: &str, to: &str) -> bool {
    let Some(object) = document.as_object_mut() else {
        return false;
    };
    if object.contains_key(to) {
        return false;
    }
    match object.remove(from) {
        Some(value) => {
            object.insert(to.to_owned(), value);
            true
        }
        None => false,
    }
}

/// Status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// The migration was applied and its documents committed.
    Applied,
}

impl LedgerStatus {
    /// Returns the status's stable name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
        }
    }
}

/// A row of the migrations ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The migrated scope.
    pub scope: DocumentScope,
    /// The applied version.
    pub version: i32,
    /// The migration's description.
    pub description: String,
    /// When the migration was committed.
    pub applied_at: DateTime<Utc>,
    /// Entry status.
    pub status: LedgerStatus,
}

/// Lifecycle state of a single migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Not yet recorded in the ledger.
    Pending,
    /// Recorded in the ledger.
    Applied,
}

/// A migration together with its ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// The migration version.
    pub version: i32,
    /// The migration's description.
    pub description: &'static str,
    /// Whether it has been applied.
    pub state: MigrationState,
}

/// What a store did when asked to apply a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Documents were rewritten and the ledger entry recorded.
    Applied {
        /// Number of documents rewritten.
        documents_changed: u64,
    },
    /// The ledger already held this version. Nothing was changed.
    AlreadyApplied,
}

/// Persistence for migrated documents and the migrations ledger.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Returns the ledger entries recorded for `scope`, in version order.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` for store failures.
    async fn ledger(&self, scope: &DocumentScope) -> Result<Vec<LedgerEntry>, MigrationError>;

    /// Applies migration `version` of `plan` as one all-or-nothing unit.
    ///
    /// Implementations must hold exclusive access to the scope for the
    /// duration, re-check the ledger under that exclusion, transform every
    /// document below `version` via [`MigrationPlan::migrate_document`],
    /// and record the ledger entry in the same transaction as the document
    /// writes. Data and ledger must never diverge.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Transform` if a document cannot be
    /// transformed, `MigrationError::LedgerWriteFailure` if the entry cannot
    /// be recorded, and `MigrationError::Store` otherwise. In every error
    /// case no document is changed.
    async fn apply_migration(
        &self,
        plan: &MigrationPlan,
        version: i32,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, MigrationError>;
}

/// Summary of one engine run over a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// The migrated scope.
    pub scope: DocumentScope,
    /// Versions applied by this run.
    pub applied: Vec<i32>,
    /// Versions already in the ledger.
    pub skipped: Vec<i32>,
    /// Documents rewritten by this run.
    pub documents_changed: u64,
}

/// Applies pending migrations in strict version order.
pub struct MigrationEngine<'a> {
    store: &'a dyn MigrationStore,
    clock: &'a dyn Clock,
}

impl<'a> MigrationEngine<'a> {
    /// Creates an engine over a store.
    #[must_use]
    pub fn new(store: &'a dyn MigrationStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Applies every migration of `plan` not yet in the ledger.
    ///
    /// Each migration is committed, ledger entry included, before the next
    /// one starts. Re-running a completed plan changes nothing.
    ///
    /// # Errors
    ///
    /// Returns the first `MigrationError` encountered. All later migrations
    /// of the plan stay pending.
    #[instrument(skip(self, plan), fields(scope = %plan.scope()))]
    pub async fn run(&self, plan: &MigrationPlan) -> Result<MigrationReport, MigrationError> {
        let recorded: BTreeSet<i32> = self
            .store
            .ledger(plan.scope())
            .await?
            .into_iter()
            .map(|entry| entry.version)
            .collect();

        let mut report = MigrationReport {
            scope: plan.scope().clone(),
            applied: Vec::new(),
            skipped: Vec::new(),
            documents_changed: 0,
        };

        for migration in plan.migrations() {
            if recorded.contains(&migration.version) {
                debug!(version = migration.version, "migration already applied");
                report.skipped.push(migration.version);
                continue;
            }

            match self
                .store
                .apply_migration(plan, migration.version, self.clock.now())
                .await
            {
                Ok(ApplyOutcome::Applied { documents_changed }) => {
                    info!(
                        version = migration.version,
                        description = migration.description,
                        documents_changed,
                        "migration applied"
                    );
                    report.applied.push(migration.version);
                    report.documents_changed += documents_changed;
                }
                Ok(ApplyOutcome::AlreadyApplied) => {
                    debug!(version = migration.version, "migration applied concurrently");
                    report.skipped.push(migration.version);
                }
                Err(e) => {
                    error!(version = migration.version, error = %e, "migration run halted");
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Runs several plans in order, halting at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first `MigrationError` encountered.
    pub async fn run_all(
        &self,
        plans: &[MigrationPlan],
    ) -> Result<Vec<MigrationReport>, MigrationError> {
        let mut reports = Vec::with_capacity(plans.len());
        for plan in plans {
            reports.push(self.run(plan).await?);
        }
        Ok(reports)
    }

    /// Reports each migration of `plan` as pending or applied.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the ledger cannot be read.
    pub async fn status(
        &self,
        plan: &MigrationPlan,
    ) -> Result<Vec<MigrationStatus>, MigrationError> {
        let recorded: BTreeSet<i32> = self
            .store
            .ledger(plan.scope())
            .await?
            .into_iter()
            .map(|entry| entry.version)
            .collect();
        Ok(plan
            .migrations()
            .iter()
            .map(|m| MigrationStatus {
                version: m.version,
                description: m.description,
                state: if recorded.contains(&m.version) {
                    MigrationState::Applied
                } else {
                    MigrationState::Pending
                },
            })
            .collect())
    }
}
