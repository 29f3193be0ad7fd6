//! Query handlers for the Bank Account context.
//!
//! `get_account_by_id` rehydrates the aggregate and is always current.
//! `get_account_summary` and `get_transaction_history` serve read models,
//! which trail the event log until their projectors catch up.

use rust_decimal::Decimal;
use serde::Serialize;
use strata_core::aggregate::AggregateRoot;
use strata_core::error::DomainError;
use strata_core::projection::ReadModelStore;
use uuid::Uuid;

use crate::application::command_handlers::AccountRehydrator;
use crate::application::projections::AccountSummary;
use crate::application::transaction_history::TransactionHistory;
use crate::domain::schema::{ACCOUNT_SUMMARY_PROJECTION, TRANSACTION_HISTORY_PROJECTION};

/// Read-only view of a bank account aggregate.
#[derive(Debug, Serialize)]
pub struct AccountView {
    /// The account identifier.
    pub account_id: Uuid,
    /// Name of the account holder.
    pub account_holder: String,
    /// ISO currency code.
    pub currency: String,
    /// Current balance.
    pub balance: Decimal,
    /// Whether the account is closed.
    pub closed: bool,
    /// Sequence number of the last event.
    pub version: i64,
}

/// Retrieves an account by its aggregate ID.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if no events exist for the ID,
/// and any error raised while decoding its stream.
pub async fn get_account_by_id(
    account_id: Uuid,
    accounts: &AccountRehydrator,
) -> Result<AccountView, DomainError> {
    let account = accounts.load(account_id).await?;
    let state = account.view();
    Ok(AccountView {
        account_id,
        account_holder: state.account_holder.clone(),
        currency: state.currency.clone(),
        balance: state.balance,
        closed: state.closed,
        version: account.version(),
    })
}

/// Retrieves the projected summary of an account.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the projection has no record
/// for the account, and `DomainError::Infrastructure` if the record cannot
/// be read or decoded.
pub async fn get_account_summary(
    account_id: Uuid,
    store: &dyn ReadModelStore,
) -> Result<AccountSummary, DomainError> {
    let record = store
        .load(ACCOUNT_SUMMARY_PROJECTION, &account_id.to_string())
        .await?
        .ok_or(DomainError::AggregateNotFound(account_id))?;
    AccountSummary::from_body(account_id, record.body)
}

/// Retrieves the projected transaction history of an account.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the projection has no record
/// for the account, and `DomainError::Infrastructure` if the record cannot
/// be read or decoded.
pub async fn get_transaction_history(
    account_id: Uuid,
    store: &dyn ReadModelStore,
) -> Result<TransactionHistory, DomainError> {
    let record = store
        .load(TRANSACTION_HISTORY_PROJECTION, &account_id.to_string())
        .await?
        .ok_or(DomainError::AggregateNotFound(account_id))?;
    TransactionHistory::from_body(account_id, record.body)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use rust_decimal_macros::dec;
    use strata_core::projection::ReadModelRecord;
    use strata_core::snapshot::SnapshotPolicy;
    use strata_test_support::{
        FixedClock, InMemoryEventRepository, InMemoryReadModelStore, InMemorySnapshotRepository,
    };

    use super::*;
    use crate::application::command_handlers::{
        account_rehydrator, handle_deposit_funds, handle_open_account,
    };
    use crate::domain::commands::{DepositFunds, OpenAccount};

    #[tokio::test]
    async fn test_get_account_by_id_returns_current_balance() {
        // Arrange
        let clock = FixedClock::new_year();
        let accounts = account_rehydrator(
            Arc::new(InMemoryEventRepository::new()),
            Arc::new(InMemorySnapshotRepository::new()),
            Arc::new(clock),
            SnapshotPolicy::never(),
        )
        .unwrap();
        let account_id = Uuid::new_v4();
        handle_open_account(
            &OpenAccount {
                correlation_id: Uuid::new_v4(),
                account_id,
                account_holder: "Ada".to_owned(),
                currency: "usd".to_owned(),
                initial_balance: dec!(5),
            },
            &clock,
            &accounts,
        )
        .await
        .unwrap();
        handle_deposit_funds(
            &DepositFunds {
                correlation_id: Uuid::new_v4(),
                account_id,
                amount: dec!(7.25),
                description: Some("salary".to_owned()),
            },
            &clock,
            &accounts,
        )
        .await
        .unwrap();

        // Act
        let view = get_account_by_id(account_id, &accounts).await.unwrap();

        // Assert
        assert_eq!(view.account_id, account_id);
        assert_eq!(view.currency, "USD");
        assert_eq!(view.balance, dec!(12.25));
        assert_eq!(view.version, 2);
        assert!(!view.closed);
    }

    #[tokio::test]
    async fn test_get_account_by_id_returns_not_found_for_unknown_id() {
        // Arrange
        let accounts = account_rehydrator(
            Arc::new(InMemoryEventRepository::new()),
            Arc::new(InMemorySnapshotRepository::new()),
            Arc::new(FixedClock::new_year()),
            SnapshotPolicy::never(),
        )
        .unwrap();
        let account_id = Uuid::new_v4();

        // Act
        let result = get_account_by_id(account_id, &accounts).await;

        // Assert
        assert!(matches!(result, Err(DomainError::AggregateNotFound(id)) if id == account_id));
    }

    #[tokio::test]
    async fn test_get_account_summary_returns_not_found_without_record() {
        // Arrange
        let store = InMemoryReadModelStore::new();
        let account_id = Uuid::new_v4();

        // Act
        let result = get_account_summary(account_id, &store).await;

        // Assert
        assert!(matches!(result, Err(DomainError::AggregateNotFound(id)) if id == account_id));
    }

    #[tokio::test]
    async fn test_get_account_summary_decodes_stored_record() {
        // Arrange
        let store = InMemoryReadModelStore::new();
        let account_id = Uuid::new_v4();
        store
            .save(&ReadModelRecord {
                projection: ACCOUNT_SUMMARY_PROJECTION.to_owned(),
                record_id: account_id.to_string(),
                schema_version: 1,
                body: serde_json::json!({
                    "account_holder": "Ada",
                    "currency": "EUR",
                    "balance": "40.00",
                    "deposits": 2,
                    "withdrawals": 1,
                    "transfers_out": 0,
                    "transfers_in": 0,
                    "reversals": 0,
                    "total_transactions": 3,
                    "closed": false,
                    "last_activity_at": "2026-01-01T00:00:00Z",
                    "projected_version": 4
                }),
                applied: BTreeMap::new(),
            })
            .await
            .unwrap();

        // Act
        let summary = get_account_summary(account_id, &store).await.unwrap();

        // Assert
        assert_eq!(summary.account_id, account_id);
        assert_eq!(summary.body.balance, dec!(40));
        assert_eq!(summary.body.total_transactions, 3);
        assert_eq!(summary.body.projected_version, 4);
    }

    #[tokio::test]
    async fn test_get_transaction_history_returns_not_found_without_record() {
        // Arrange
        let store = InMemoryReadModelStore::new();
        let account_id = Uuid::new_v4();

        // Act
        let result = get_transaction_history(account_id, &store).await;

        // Assert
        assert!(matches!(result, Err(DomainError::AggregateNotFound(id)) if id == account_id));
    }
}
