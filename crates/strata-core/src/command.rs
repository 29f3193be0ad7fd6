//! Command abstractions.

use serde::Serialize;
use uuid::Uuid;

/// Trait that all commands implement.
pub trait Command: Send + Sync + std::fmt::Debug {
    /// The type name for this command (for logging/routing).
    fn command_type(&self) -> &'static str;

    /// Correlation ID to trace this command through the system.
    fn correlation_id(&self) -> Uuid;

    /// The aggregate this command targets.
    fn aggregate_id(&self) -> Uuid;
}

/// Result of submitting a command through the generic command API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Events were appended; the stream now ends at `new_sequence`.
    Accepted {
        /// Sequence number of the last appended event.
        new_sequence: i64,
        /// IDs of the appended events.
        event_ids: Vec<Uuid>,
    },
    /// The command was refused by domain rules or a concurrency check.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
}
