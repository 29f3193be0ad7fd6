//! Versioned JSON document codec.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::migration::MigrationPlan;

/// The JSON document form every persisted record takes.
pub type Document = serde_json::Value;

/// A document tagged with the schema version it was written with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDocument {
    /// Schema version of `body`.
    pub schema_version: i32,
    /// The document itself.
    pub body: Document,
}

/// Encodes values at the current schema version and decodes documents of
/// any older version by upgrading them through a [`MigrationPlan`].
#[derive(Debug, Clone)]
pub struct DocumentCodec<T> {
    plan: MigrationPlan,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DocumentCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a codec for the scope and history described by `plan`.
    #[must_use]
    pub fn new(plan: MigrationPlan) -> Self {
        Self {
            plan,
            _marker: PhantomData,
        }
    }

    /// Returns the migration plan.
    #[must_use]
    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    /// The version newly encoded documents carry.
    #[must_use]
    pub fn current_version(&self) -> i32 {
        self.plan.latest_version()
    }

    /// Encodes a value at the current version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if serialization fails.
    pub fn encode(&self, value: &T) -> Result<VersionedDocument, DomainError> {
        let body = serde_json::to_value(value).map_err(|e| {
            DomainError::Infrastructure(format!("encoding {} failed: {e}", self.plan.scope()))
        })?;
        Ok(VersionedDocument {
            schema_version: self.current_version(),
            body,
        })
    }

    /// Decodes a document, upgrading it first if it is older than the
    /// current version. Nothing is written back.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnsupportedSchema` for documents newer than this
    /// build, and `DomainError::Infrastructure` if upgrading or
    /// deserialization fails.
    pub fn decode(&self, document: VersionedDocument) -> Result<T, DomainError> {
        let body = self.plan.upgrade(document.body, document.schema_version)?;
        serde_json::from_value(body).map_err(|e| {
            DomainError::Infrastructure(format!("decoding {} failed: {e}", self.plan.scope()))
        })
    }
}
