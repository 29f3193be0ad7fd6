//! The `transaction_history` read model.
//!
//! One record per account, keyed by the account ID, listing every
//! balance-affecting event in stream order together with the running
//! balance after it. Transfer requests and closing leave no entry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strata_core::aggregate::AggregateRoot;
use strata_core::codec::Document;
use strata_core::error::{DomainError, MigrationError};
use strata_core::migration::MigrationPlan;
use strata_core::projection::Projection;
use strata_core::registry::EventRegistry;
use strata_core::repository::StoredEvent;
use uuid::Uuid;

use crate::domain::aggregates::BankAccount;
use crate::domain::events::BankAccountEventKind;
use crate::domain::schema::{
    TRANSACTION_HISTORY_PROJECTION, event_registry, transaction_history_plan,
};

/// Kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// The opening balance.
    Opening,
    /// Cash in.
    Deposit,
    /// Cash out.
    Withdrawal,
    /// Debit leg of a transfer.
    TransferOut,
    /// Credit leg of a transfer.
    TransferIn,
    /// Refund of a transfer debit.
    TransferReversal,
}

/// One line of an account's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    /// The event this entry was projected from.
    pub event_id: Uuid,
    /// Stream position of that event.
    pub sequence_number: i64,
    /// What happened.
    pub transaction_type: TransactionType,
    /// Unsigned amount moved.
    pub amount: Decimal,
    /// Free-text note carried by deposits and withdrawals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The other account of a transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_account_id: Option<Uuid>,
    /// The transfer this entry belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<Uuid>,
    /// Balance once this entry is applied.
    pub balance_after: Decimal,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// Stored body of a `transaction_history` record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionHistoryBody {
    /// Running balance after the last entry.
    pub balance: Decimal,
    /// Entries, oldest first.
    pub entries: Vec<TransactionEntry>,
}

/// A projected history as served to queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionHistory {
    /// The account identifier.
    pub account_id: Uuid,
    /// Projected fields.
    #[serde(flatten)]
    pub body: TransactionHistoryBody,
}

impl TransactionHistory {
    /// Decodes a stored record body.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the body is malformed.
    pub fn from_body(account_id: Uuid, body: Document) -> Result<Self, DomainError> {
        let body = serde_json::from_value(body).map_err(|e| {
            DomainError::Infrastructure(format!("malformed transaction history {account_id}: {e}"))
        })?;
        Ok(Self { account_id, body })
    }
}

/// Folds bank account events into `transaction_history` records.
pub struct TransactionHistoryProjection {
    plan: MigrationPlan,
    registry: EventRegistry<BankAccountEventKind>,
}

impl TransactionHistoryProjection {
    /// Creates the projection.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidPlan` if an event plan is malformed.
    pub fn new() -> Result<Self, MigrationError> {
        Ok(Self {
            plan: transaction_history_plan(),
            registry: event_registry()?,
        })
    }
}

impl Projection for TransactionHistoryProjection {
    fn name(&self) -> &'static str {
        TRANSACTION_HISTORY_PROJECTION
    }

    fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    fn record_ids(&self, event: &StoredEvent) -> Vec<String> {
        if event.aggregate_type == BankAccount::AGGREGATE_TYPE {
            vec![event.aggregate_id.to_string()]
        } else {
            Vec::new()
        }
    }

    fn initial_body(&self, _record_id: &str) -> Document {
        serde_json::to_value(TransactionHistoryBody::default()).unwrap_or_default()
    }

    fn apply(&self, body: &mut Document, event: &StoredEvent) -> Result<(), DomainError> {
        let kind = self.registry.decode(
            &event.event_type,
            event.schema_version,
            event.payload.clone(),
        )?;
        let mut history: TransactionHistoryBody =
            serde_json::from_value(body.clone()).map_err(|e| {
                DomainError::Infrastructure(format!("malformed transaction history: {e}"))
            })?;

        // (type, amount, signed delta, description, counterparty, transfer)
        let line = match kind {
            BankAccountEventKind::AccountOpened(p) => Some((
                TransactionType::Opening,
                p.initial_balance,
                p.initial_balance,
                None,
                None,
                None,
            )),
            BankAccountEventKind::FundsDeposited(p) => Some((
                TransactionType::Deposit,
                p.amount,
                p.amount,
                p.description,
                None,
                None,
            )),
            BankAccountEventKind::FundsWithdrawn(p) => Some((
                TransactionType::Withdrawal,
                p.amount,
                -p.amount,
                p.description,
                None,
                None,
            )),
            BankAccountEventKind::FundsTransferredOut(p) => Some((
                TransactionType::TransferOut,
                p.amount,
                -p.amount,
                None,
                Some(p.target_account_id),
                Some(p.transfer_id),
            )),
            BankAccountEventKind::FundsTransferredIn(p) => Some((
                TransactionType::TransferIn,
                p.amount,
                p.amount,
                None,
                Some(p.source_account_id),
                Some(p.transfer_id),
            )),
            BankAccountEventKind::TransferReversed(p) => Some((
                TransactionType::TransferReversal,
                p.amount,
                p.amount,
                None,
                None,
                Some(p.transfer_id),
            )),
            BankAccountEventKind::TransferRequested(_) | BankAccountEventKind::AccountClosed(_) => {
                None
            }
        };

        if let Some((transaction_type, amount, delta, description, counterparty, transfer)) = line
        {
            history.balance += delta;
            history.entries.push(TransactionEntry {
                event_id: event.event_id,
                sequence_number: event.sequence_number,
                transaction_type,
                amount,
                description,
                counterparty_account_id: counterparty,
                transfer_id: transfer,
                balance_after: history.balance,
                occurred_at: event.occurred_at,
            });
        }

        *body = serde_json::to_value(&history).map_err(|e| {
            DomainError::Infrastructure(format!("transaction history encoding: {e}"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;
    use strata_core::projection::Projector;
    use strata_test_support::{InMemoryEventRepository, InMemoryReadModelStore, stored_event};

    use super::*;
    use crate::domain::events::{
        ACCOUNT_CLOSED_EVENT_TYPE, ACCOUNT_OPENED_EVENT_TYPE, FUNDS_DEPOSITED_EVENT_TYPE,
        FUNDS_TRANSFERRED_OUT_EVENT_TYPE, FUNDS_WITHDRAWN_EVENT_TYPE,
        TRANSFER_REQUESTED_EVENT_TYPE, TRANSFER_REVERSED_EVENT_TYPE,
    };

    fn account_event(
        account_id: Uuid,
        sequence: i64,
        event_type: &str,
        schema_version: i32,
        payload: Document,
    ) -> StoredEvent {
        let mut event = stored_event(account_id, sequence, event_type, payload);
        event.aggregate_type = BankAccount::AGGREGATE_TYPE.to_owned();
        event.schema_version = schema_version;
        event
    }

    fn history(account_id: Uuid, transfer_id: Uuid, target: Uuid) -> Vec<StoredEvent> {
        vec![
            account_event(
                account_id,
                1,
                ACCOUNT_OPENED_EVENT_TYPE,
                1,
                serde_json::json!({
                    "account_holder": "Ada",
                    "currency": "EUR",
                    "initial_balance": "100"
                }),
            ),
            account_event(
                account_id,
                2,
                FUNDS_DEPOSITED_EVENT_TYPE,
                1,
                serde_json::json!({"amt": "25.50"}),
            ),
            account_event(
                account_id,
                3,
                FUNDS_WITHDRAWN_EVENT_TYPE,
                1,
                serde_json::json!({"amount": "10.50", "description": "rent"}),
            ),
            account_event(
                account_id,
                4,
                TRANSFER_REQUESTED_EVENT_TYPE,
                1,
                serde_json::json!({
                    "transfer_id": transfer_id,
                    "target_account_id": target,
                    "amount": "40"
                }),
            ),
            account_event(
                account_id,
                5,
                FUNDS_TRANSFERRED_OUT_EVENT_TYPE,
                1,
                serde_json::json!({
                    "transfer_id": transfer_id,
                    "target_account_id": target,
                    "amount": "40"
                }),
            ),
            account_event(
                account_id,
                6,
                TRANSFER_REVERSED_EVENT_TYPE,
                1,
                serde_json::json!({"transfer_id": transfer_id, "amount": "40"}),
            ),
            account_event(
                account_id,
                7,
                ACCOUNT_CLOSED_EVENT_TYPE,
                1,
                serde_json::json!({}),
            ),
        ]
    }

    #[tokio::test]
    async fn test_history_lists_balance_affecting_events_with_running_balance() {
        // Arrange
        let account_id = Uuid::new_v4();
        let transfer_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        let events = Arc::new(InMemoryEventRepository::new());
        events.seed(history(account_id, transfer_id, target));
        let projector = Projector::new(
            TransactionHistoryProjection::new().unwrap(),
            events,
            Arc::new(InMemoryReadModelStore::new()),
        );

        // Act
        let processed = projector.catch_up().await.unwrap();

        // Assert
        assert_eq!(processed, 7);
        let record = projector
            .record(&account_id.to_string())
            .await
            .unwrap()
            .unwrap();
        let history = TransactionHistory::from_body(account_id, record.body).unwrap();
        let kinds: Vec<TransactionType> = history
            .body
            .entries
            .iter()
            .map(|e| e.transaction_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TransactionType::Opening,
                TransactionType::Deposit,
                TransactionType::Withdrawal,
                TransactionType::TransferOut,
                TransactionType::TransferReversal,
            ]
        );
        let balances: Vec<Decimal> = history
            .body
            .entries
            .iter()
            .map(|e| e.balance_after)
            .collect();
        assert_eq!(
            balances,
            vec![dec!(100), dec!(125.50), dec!(115), dec!(75), dec!(115)]
        );
        assert_eq!(history.body.balance, dec!(115));
        let debit = &history.body.entries[3];
        assert_eq!(debit.amount, dec!(40));
        assert_eq!(debit.counterparty_account_id, Some(target));
        assert_eq!(debit.transfer_id, Some(transfer_id));
        assert_eq!(history.body.entries[2].description.as_deref(), Some("rent"));
    }

    #[tokio::test]
    async fn test_redelivered_event_adds_no_entry() {
        // Arrange
        let account_id = Uuid::new_v4();
        let events = Arc::new(InMemoryEventRepository::new());
        events.seed(history(account_id, Uuid::new_v4(), Uuid::new_v4()));
        let projector = Projector::new(
            TransactionHistoryProjection::new().unwrap(),
            events.clone(),
            Arc::new(InMemoryReadModelStore::new()),
        );
        projector.catch_up().await.unwrap();

        // Act
        let written = projector
            .apply_event(&events.all_events()[1])
            .await
            .unwrap();

        // Assert
        assert_eq!(written, 0);
        let record = projector
            .record(&account_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.body["entries"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_rebuild_reproduces_the_same_history() {
        // Arrange
        let account_id = Uuid::new_v4();
        let events = Arc::new(InMemoryEventRepository::new());
        events.seed(history(account_id, Uuid::new_v4(), Uuid::new_v4()));
        let projector = Projector::new(
            TransactionHistoryProjection::new().unwrap(),
            events,
            Arc::new(InMemoryReadModelStore::new()),
        );
        projector.catch_up().await.unwrap();
        let before = projector.record(&account_id.to_string()).await.unwrap();

        // Act
        let processed = projector.rebuild().await.unwrap();

        // Assert
        assert_eq!(processed, 7);
        let after = projector.record(&account_id.to_string()).await.unwrap();
        assert_eq!(before, after);
    }
}
