//! Schema history of every document the Bank Account context persists.
//!
//! Event payloads, account snapshots and both read models each carry a
//! schema version. The plans here upgrade old documents on read and are
//! also handed to the migration engine at startup.

use strata_core::aggregate::AggregateRoot;
use strata_core::codec::{Document, DocumentCodec};
use strata_core::error::MigrationError;
use strata_core::migration::{DocumentScope, Migration, MigrationPlan, rename_field};
use strata_core::registry::EventRegistry;

use super::aggregates::{BankAccount, BankAccountState};
use super::events::{
    ACCOUNT_CLOSED_EVENT_TYPE, ACCOUNT_OPENED_EVENT_TYPE, BankAccountEventKind,
    FUNDS_DEPOSITED_EVENT_TYPE, FUNDS_TRANSFERRED_IN_EVENT_TYPE,
    FUNDS_TRANSFERRED_OUT_EVENT_TYPE, FUNDS_WITHDRAWN_EVENT_TYPE, TRANSFER_REQUESTED_EVENT_TYPE,
    TRANSFER_REVERSED_EVENT_TYPE,
};

/// Name of the account summary projection.
pub const ACCOUNT_SUMMARY_PROJECTION: &str = "account_summary";

/// Name of the transaction history projection.
pub const TRANSACTION_HISTORY_PROJECTION: &str = "transaction_history";

/// `funds_deposited` v1 stored the amount under `amt`.
fn rename_amt_to_amount(mut payload: Document) -> Result<Document, String> {
    rename_field(&mut payload, "amt", "amount");
    Ok(payload)
}

/// Schema history of `bank_account.funds_deposited` payloads.
///
/// # Errors
///
/// Returns `MigrationError::InvalidPlan` if the plan is malformed.
pub fn funds_deposited_plan() -> Result<MigrationPlan, MigrationError> {
    MigrationPlan::new(
        DocumentScope::events(FUNDS_DEPOSITED_EVENT_TYPE),
        vec![Migration {
            version: 2,
            description: "rename amt to amount",
            apply: rename_amt_to_amount,
        }],
    )
}

/// Schema history of `BankAccount` snapshots.
#[must_use]
pub fn snapshot_plan() -> MigrationPlan {
    MigrationPlan::initial(DocumentScope::snapshots(BankAccount::AGGREGATE_TYPE))
}

/// Schema history of `account_summary` records.
#[must_use]
pub fn account_summary_plan() -> MigrationPlan {
    MigrationPlan::initial(DocumentScope::read_models(ACCOUNT_SUMMARY_PROJECTION))
}

/// Schema history of `transaction_history` records.
#[must_use]
pub fn transaction_history_plan() -> MigrationPlan {
    MigrationPlan::initial(DocumentScope::read_models(TRANSACTION_HISTORY_PROJECTION))
}

/// Builds the registry decoding every bank account event type.
///
/// # Errors
///
/// Returns `MigrationError::InvalidPlan` if a plan is malformed.
pub fn event_registry() -> Result<EventRegistry<BankAccountEventKind>, MigrationError> {
    fn initial(event_type: &str) -> MigrationPlan {
        MigrationPlan::initial(DocumentScope::events(event_type))
    }

    Ok(EventRegistry::new()
        .register(
            ACCOUNT_OPENED_EVENT_TYPE,
            initial(ACCOUNT_OPENED_EVENT_TYPE),
            |doc| serde_json::from_value(doc).map(BankAccountEventKind::AccountOpened),
        )
        .register(FUNDS_DEPOSITED_EVENT_TYPE, funds_deposited_plan()?, |doc| {
            serde_json::from_value(doc).map(BankAccountEventKind::FundsDeposited)
        })
        .register(
            FUNDS_WITHDRAWN_EVENT_TYPE,
            initial(FUNDS_WITHDRAWN_EVENT_TYPE),
            |doc| serde_json::from_value(doc).map(BankAccountEventKind::FundsWithdrawn),
        )
        .register(
            TRANSFER_REQUESTED_EVENT_TYPE,
            initial(TRANSFER_REQUESTED_EVENT_TYPE),
            |doc| serde_json::from_value(doc).map(BankAccountEventKind::TransferRequested),
        )
        .register(
            FUNDS_TRANSFERRED_OUT_EVENT_TYPE,
            initial(FUNDS_TRANSFERRED_OUT_EVENT_TYPE),
            |doc| serde_json::from_value(doc).map(BankAccountEventKind::FundsTransferredOut),
        )
        .register(
            FUNDS_TRANSFERRED_IN_EVENT_TYPE,
            initial(FUNDS_TRANSFERRED_IN_EVENT_TYPE),
            |doc| serde_json::from_value(doc).map(BankAccountEventKind::FundsTransferredIn),
        )
        .register(
            TRANSFER_REVERSED_EVENT_TYPE,
            initial(TRANSFER_REVERSED_EVENT_TYPE),
            |doc| serde_json::from_value(doc).map(BankAccountEventKind::TransferReversed),
        )
        .register(
            ACCOUNT_CLOSED_EVENT_TYPE,
            initial(ACCOUNT_CLOSED_EVENT_TYPE),
            |doc| serde_json::from_value(doc).map(BankAccountEventKind::AccountClosed),
        ))
}

/// Builds the codec for `BankAccount` snapshots.
#[must_use]
pub fn snapshot_codec() -> DocumentCodec<BankAccountState> {
    DocumentCodec::new(snapshot_plan())
}

/// Every plan the migration engine should run, events first.
///
/// # Errors
///
/// Returns `MigrationError::InvalidPlan` if a plan is malformed.
pub fn migration_plans() -> Result<Vec<MigrationPlan>, MigrationError> {
    let mut plans: Vec<MigrationPlan> = event_registry()?.plans().cloned().collect();
    plans.sort_by(|a, b| a.scope().cmp(b.scope()));
    plans.push(snapshot_plan());
    plans.push(account_summary_plan());
    plans.push(transaction_history_plan());
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rust_decimal_macros::dec;
    use strata_core::error::DomainError;

    use super::*;
    use crate::domain::events::FundsDeposited;

    #[test]
    fn test_legacy_deposit_payload_decodes_after_upgrade() {
        let registry = event_registry().unwrap();

        let kind = registry
            .decode(
                FUNDS_DEPOSITED_EVENT_TYPE,
                1,
                serde_json::json!({"amt": "12.50"}),
            )
            .unwrap();

        assert_eq!(
            kind,
            BankAccountEventKind::FundsDeposited(FundsDeposited {
                amount: dec!(12.50),
                description: None,
            })
        );
    }

    #[test]
    fn test_new_deposits_are_written_at_v2() {
        let registry = event_registry().unwrap();

        assert_eq!(registry.current_version(FUNDS_DEPOSITED_EVENT_TYPE).unwrap(), 2);
        assert_eq!(
            registry.current_version(ACCOUNT_OPENED_EVENT_TYPE).unwrap(),
            1
        );
    }

    #[test]
    fn test_deposit_from_future_schema_is_rejected() {
        let registry = event_registry().unwrap();

        let result = registry.decode(
            FUNDS_DEPOSITED_EVENT_TYPE,
            3,
            serde_json::json!({"amount": "1"}),
        );

        assert!(matches!(
            result,
            Err(DomainError::UnsupportedSchema {
                found: 3,
                supported: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_migration_plans_cover_every_scope_once() {
        let plans = migration_plans().unwrap();

        assert_eq!(plans.len(), 11);
        let scopes: BTreeSet<String> = plans.iter().map(|p| p.scope().to_string()).collect();
        assert_eq!(scopes.len(), 11);
        assert!(scopes.contains(&"snapshots:bank_account".to_owned()));
        assert!(scopes.contains(&"read_models:account_summary".to_owned()));
        assert!(scopes.contains(&"read_models:transaction_history".to_owned()));
    }
}
