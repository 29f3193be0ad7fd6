//! In-memory `MigrationStore`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_core::codec::VersionedDocument;
use strata_core::error::MigrationError;
use strata_core::migration::{
    ApplyOutcome, DocumentScope, LedgerEntry, LedgerStatus, MigrationPlan, MigrationStore,
};

#[derive(Debug, Default)]
struct State {
    documents: HashMap<DocumentScope, BTreeMap<String, VersionedDocument>>,
    ledger: Vec<LedgerEntry>,
}

/// Versioned documents and a migrations ledger held in memory.
///
/// Each migration is staged against a copy of the scope's documents and
/// only committed together with its ledger entry. Ledger writes can be made
/// to fail to exercise the rollback path.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<State>,
    fail_ledger_writes: AtomicBool,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a document.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn insert(&self, scope: &DocumentScope, id: &str, document: VersionedDocument) {
        self.state
            .lock()
            .unwrap()
            .documents
            .entry(scope.clone())
            .or_default()
            .insert(id.to_owned(), document);
    }

    /// Returns a document.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn document(&self, scope: &DocumentScope, id: &str) -> Option<VersionedDocument> {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(scope)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Makes every subsequent ledger write fail (or succeed again).
    pub fn fail_ledger_writes(&self, fail: bool) {
        self.fail_ledger_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MigrationStore for InMemoryDocumentStore {
    async fn ledger(&self, scope: &DocumentScope) -> Result<Vec<LedgerEntry>, MigrationError> {
        let mut entries: Vec<LedgerEntry> = self
            .state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .filter(|e| &e.scope == scope)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    async fn apply_migration(
        &self,
        plan: &MigrationPlan,
        version: i32,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, MigrationError> {
        let migration = plan.migration(version)?;
        let scope = plan.scope();
        let mut state = self.state.lock().unwrap();

        if state
            .ledger
            .iter()
            .any(|e| &e.scope == scope && e.version == version)
        {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let mut staged = Vec::new();
        if let Some(documents) = state.documents.get(scope) {
            for (id, document) in documents {
                if let Some(migrated) = plan.migrate_document(version, id, document.clone())? {
                    staged.push((id.clone(), migrated));
                }
            }
        }

        if self.fail_ledger_writes.load(Ordering::SeqCst) {
            return Err(MigrationError::LedgerWriteFailure {
                scope: scope.to_string(),
                version,
                reason: "ledger unavailable".to_owned(),
            });
        }

        let documents_changed = staged.len() as u64;
        let documents = state.documents.entry(scope.clone()).or_default();
        for (id, migrated) in staged {
            documents.insert(id, migrated);
        }
        state.ledger.push(LedgerEntry {
            scope: scope.clone(),
            version,
            description: migration.description.to_owned(),
            applied_at,
            status: LedgerStatus::Applied,
        });

        Ok(ApplyOutcome::Applied { documents_changed })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use strata_core::codec::Document;
    use strata_core::migration::Migration;

    use super::*;

    fn require_object(doc: Document) -> Result<Document, String> {
        if doc.is_object() {
            Ok(doc)
        } else {
            Err("payload is not an object".to_owned())
        }
    }

    fn plan() -> MigrationPlan {
        MigrationPlan::new(
            DocumentScope::events("ledger.posted"),
            vec![Migration {
                version: 2,
                description: "require object payloads",
                apply: require_object,
            }],
        )
        .unwrap()
    }

    fn v1(body: Document) -> VersionedDocument {
        VersionedDocument {
            schema_version: 1,
            body,
        }
    }

    fn applied_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_failure_midway_through_a_scope_rolls_back_every_document() {
        // Arrange
        let store = InMemoryDocumentStore::new();
        let plan = plan();
        store.insert(plan.scope(), "a", v1(json!({"amount": 1})));
        store.insert(plan.scope(), "b", v1(json!("broken")));
        store.insert(plan.scope(), "c", v1(json!({"amount": 3})));

        // Act
        let result = store.apply_migration(&plan, 2, applied_at()).await;

        // Assert
        assert!(matches!(
            result,
            Err(MigrationError::Transform { version: 2, ref document_id, .. }) if document_id == "b"
        ));
        for id in ["a", "b", "c"] {
            assert_eq!(store.document(plan.scope(), id).unwrap().schema_version, 1);
        }
        assert!(store.ledger(plan.scope()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_write_failure_discards_staged_documents() {
        // Arrange
        let store = InMemoryDocumentStore::new();
        let plan = plan();
        store.insert(plan.scope(), "a", v1(json!({"amount": 1})));
        store.fail_ledger_writes(true);

        // Act
        let failed = store.apply_migration(&plan, 2, applied_at()).await;
        store.fail_ledger_writes(false);
        let retried = store.apply_migration(&plan, 2, applied_at()).await;

        // Assert
        assert!(matches!(
            failed,
            Err(MigrationError::LedgerWriteFailure { version: 2, .. })
        ));
        assert_eq!(
            retried.unwrap(),
            ApplyOutcome::Applied {
                documents_changed: 1
            }
        );
        assert_eq!(store.document(plan.scope(), "a").unwrap().schema_version, 2);
        assert_eq!(store.ledger(plan.scope()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recorded_migration_is_not_applied_again() {
        // Arrange
        let store = InMemoryDocumentStore::new();
        let plan = plan();
        store.insert(plan.scope(), "a", v1(json!({"amount": 1})));
        store.apply_migration(&plan, 2, applied_at()).await.unwrap();

        // Act
        let outcome = store.apply_migration(&plan, 2, applied_at()).await.unwrap();

        // Assert
        assert_eq!(outcome, ApplyOutcome::AlreadyApplied);
        assert_eq!(store.ledger(plan.scope()).await.unwrap().len(), 1);
    }
}
