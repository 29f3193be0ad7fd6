//! Event type registry.
//!
//! Maps stored event type names to their migration plan and payload
//! decoder. Rehydration looks every stored event up here, so an event type
//! missing from the registry cannot be replayed.

use std::collections::HashMap;

use crate::codec::Document;
use crate::error::DomainError;
use crate::migration::MigrationPlan;

/// Decodes an upgraded payload into an event variant.
pub type PayloadDecoder<K> = fn(Document) -> Result<K, serde_json::Error>;

struct Registration<K> {
    plan: MigrationPlan,
    decode: PayloadDecoder<K>,
}

/// Registry of decodable event types producing variants of `K`.
pub struct EventRegistry<K> {
    entries: HashMap<&'static str, Registration<K>>,
}

impl<K> EventRegistry<K> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers an event type with its schema history and decoder.
    #[must_use]
    pub fn register(
        mut self,
        event_type: &'static str,
        plan: MigrationPlan,
        decode: PayloadDecoder<K>,
    ) -> Self {
        self.entries.insert(event_type, Registration { plan, decode });
        self
    }

    /// Returns the schema version new payloads of `event_type` are written
    /// with.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownEventType` if the type is not registered.
    pub fn current_version(&self, event_type: &str) -> Result<i32, DomainError> {
        self.entries
            .get(event_type)
            .map(|r| r.plan.latest_version())
            .ok_or_else(|| DomainError::UnknownEventType(event_type.to_owned()))
    }

    /// Upgrades a stored payload to the current version and decodes it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownEventType` for unregistered types,
    /// `DomainError::UnsupportedSchema` for payloads newer than this build,
    /// and `DomainError::Infrastructure` if upgrading or decoding fails.
    pub fn decode(
        &self,
        event_type: &str,
        schema_version: i32,
        payload: Document,
    ) -> Result<K, DomainError> {
        let registration = self
            .entries
            .get(event_type)
            .ok_or_else(|| DomainError::UnknownEventType(event_type.to_owned()))?;
        let upgraded = registration.plan.upgrade(payload, schema_version)?;
        (registration.decode)(upgraded).map_err(|e| {
            DomainError::Infrastructure(format!("decoding {event_type} payload failed: {e}"))
        })
    }

    /// Returns the migration plans of every registered event type.
    pub fn plans(&self) -> impl Iterator<Item = &MigrationPlan> {
        self.entries.values().map(|r| &r.plan)
    }
}

impl<K> Default for EventRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}
