//! Command handlers for the Bank Account context.
//!
//! Each handler loads the account through the rehydrator, runs the domain
//! method and commits the resulting events. Snapshots are taken by the
//! rehydrator on commit.

use std::sync::Arc;

use strata_core::clock::Clock;
use strata_core::error::{DomainError, MigrationError};
use strata_core::rehydrate::Rehydrator;
use strata_core::repository::{EventRepository, StoredEvent};
use strata_core::snapshot::{SnapshotPolicy, SnapshotRepository};
use tracing::{debug, instrument};

use crate::domain::aggregates::BankAccount;
use crate::domain::commands::{
    CloseAccount, DepositFunds, OpenAccount, RequestTransfer, ReverseTransfer, TransferIn,
    TransferOut, WithdrawFunds,
};
use crate::domain::schema::{event_registry, snapshot_codec};

/// Loads and commits `BankAccount` aggregates.
pub type AccountRehydrator = Rehydrator<BankAccount>;

/// Builds the account rehydrator over the given stores.
///
/// # Errors
///
/// Returns `MigrationError::InvalidPlan` if an event plan is malformed.
pub fn account_rehydrator(
    events: Arc<dyn EventRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
    clock: Arc<dyn Clock>,
    policy: SnapshotPolicy,
) -> Result<AccountRehydrator, MigrationError> {
    Ok(Rehydrator::new(
        events,
        snapshots,
        Arc::new(event_registry()?),
        Arc::new(snapshot_codec()),
        clock,
    )
    .with_policy(policy))
}

/// Handles the `OpenAccount` command.
///
/// This is a CREATION command: the account must not exist yet.
///
/// # Errors
///
/// Returns `DomainError::Validation` if the account exists or the input is
/// invalid, and `DomainError::ConcurrencyConflict` if another writer
/// created it first.
#[instrument(skip_all, fields(account_id = %command.account_id))]
pub async fn handle_open_account(
    command: &OpenAccount,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut account = accounts.load_or_empty(command.account_id).await?;
    account.open(
        &command.account_holder,
        &command.currency,
        command.initial_balance,
        command.correlation_id,
        clock,
    )?;
    let stored = accounts.commit(&mut account).await?;
    debug!("account opened");
    Ok(stored)
}

/// Handles the `DepositFunds` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the account does not exist,
/// and the domain or store error otherwise.
pub async fn handle_deposit_funds(
    command: &DepositFunds,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut account = accounts.load(command.account_id).await?;
    account.deposit(
        command.amount,
        command.description.clone(),
        command.correlation_id,
        clock,
    )?;
    accounts.commit(&mut account).await
}

/// Handles the `WithdrawFunds` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the account does not exist,
/// and the domain or store error otherwise.
pub async fn handle_withdraw_funds(
    command: &WithdrawFunds,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut account = accounts.load(command.account_id).await?;
    account.withdraw(
        command.amount,
        command.description.clone(),
        command.correlation_id,
        clock,
    )?;
    accounts.commit(&mut account).await
}

/// Handles the `RequestTransfer` command. The target account is checked
/// for existence only; crediting it is the saga's job.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if either account does not
/// exist, and the domain or store error otherwise.
pub async fn handle_request_transfer(
    command: &RequestTransfer,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    if accounts
        .events()
        .current_sequence(command.target_account_id)
        .await?
        == 0
    {
        return Err(DomainError::AggregateNotFound(command.target_account_id));
    }
    let mut account = accounts.load(command.account_id).await?;
    account.request_transfer(
        command.transfer_id,
        command.target_account_id,
        command.amount,
        command.correlation_id,
        clock,
    )?;
    accounts.commit(&mut account).await
}

/// Handles the `TransferOut` command issued by the transfer saga.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the account does not exist,
/// and the domain or store error otherwise.
pub async fn handle_transfer_out(
    command: &TransferOut,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut account = accounts.load(command.account_id).await?;
    account.transfer_out(
        command.transfer_id,
        command.target_account_id,
        command.amount,
        command.correlation_id,
        clock,
    )?;
    accounts.commit(&mut account).await
}

/// Handles the `TransferIn` command issued by the transfer saga.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the account does not exist,
/// and the domain or store error otherwise.
pub async fn handle_transfer_in(
    command: &TransferIn,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut account = accounts.load(command.account_id).await?;
    account.transfer_in(
        command.transfer_id,
        command.source_account_id,
        command.amount,
        command.correlation_id,
        clock,
    )?;
    accounts.commit(&mut account).await
}

/// Handles the `ReverseTransfer` compensation issued by the transfer saga.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the account does not exist,
/// and the domain or store error otherwise.
pub async fn handle_reverse_transfer(
    command: &ReverseTransfer,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut account = accounts.load(command.account_id).await?;
    account.reverse_transfer(command.transfer_id, command.correlation_id, clock)?;
    accounts.commit(&mut account).await
}

/// Handles the `CloseAccount` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the account does not exist,
/// and the domain or store error otherwise.
pub async fn handle_close_account(
    command: &CloseAccount,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<Vec<StoredEvent>, DomainError> {
    let mut account = accounts.load(command.account_id).await?;
    account.close(command.correlation_id, clock)?;
    accounts.commit(&mut account).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use strata_core::error::DomainError;
    use strata_core::snapshot::SnapshotPolicy;
    use strata_test_support::{
        FailingEventRepository, FixedClock, InMemoryEventRepository, InMemorySnapshotRepository,
    };
    use uuid::Uuid;

    use super::*;
    use crate::domain::events::{
        ACCOUNT_OPENED_EVENT_TYPE, FUNDS_DEPOSITED_EVENT_TYPE, FUNDS_TRANSFERRED_OUT_EVENT_TYPE,
        TRANSFER_REVERSED_EVENT_TYPE,
    };

    struct Fixture {
        events: Arc<InMemoryEventRepository>,
        snapshots: Arc<InMemorySnapshotRepository>,
        accounts: AccountRehydrator,
        clock: FixedClock,
    }

    fn fixture(policy: SnapshotPolicy) -> Fixture {
        let events = Arc::new(InMemoryEventRepository::new());
        let snapshots = Arc::new(InMemorySnapshotRepository::new());
        let accounts = account_rehydrator(
            events.clone(),
            snapshots.clone(),
            Arc::new(FixedClock::new_year()),
            policy,
        )
        .unwrap();
        Fixture {
            events,
            snapshots,
            accounts,
            clock: FixedClock::new_year(),
        }
    }

    async fn open(f: &Fixture, balance: Decimal) -> Uuid {
        let account_id = Uuid::new_v4();
        handle_open_account(
            &OpenAccount {
                correlation_id: Uuid::new_v4(),
                account_id,
                account_holder: "Ada".to_owned(),
                currency: "EUR".to_owned(),
                initial_balance: balance,
            },
            &f.clock,
            &f.accounts,
        )
        .await
        .unwrap();
        account_id
    }

    fn deposit(account_id: Uuid, amount: Decimal) -> DepositFunds {
        DepositFunds {
            correlation_id: Uuid::new_v4(),
            account_id,
            amount,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_open_account_persists_opened_event() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());

        // Act
        let account_id = open(&f, dec!(25)).await;

        // Assert
        let stored = f.events.all_events();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].aggregate_id, account_id);
        assert_eq!(stored[0].event_type, ACCOUNT_OPENED_EVENT_TYPE);
        assert_eq!(stored[0].aggregate_type, "bank_account");
        assert_eq!(stored[0].payload["initial_balance"], "25");
    }

    #[tokio::test]
    async fn test_open_existing_account_is_rejected() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());
        let account_id = open(&f, dec!(0)).await;

        // Act
        let result = handle_open_account(
            &OpenAccount {
                correlation_id: Uuid::new_v4(),
                account_id,
                account_holder: "Bob".to_owned(),
                currency: "EUR".to_owned(),
                initial_balance: dec!(0),
            },
            &f.clock,
            &f.accounts,
        )
        .await;

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(f.events.all_events().len(), 1);
    }

    #[tokio::test]
    async fn test_deposit_is_stamped_with_current_schema_version() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());
        let account_id = open(&f, dec!(0)).await;

        // Act
        let stored = handle_deposit_funds(&deposit(account_id, dec!(10)), &f.clock, &f.accounts)
            .await
            .unwrap();

        // Assert
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_type, FUNDS_DEPOSITED_EVENT_TYPE);
        assert_eq!(stored[0].schema_version, 2);
        assert_eq!(stored[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_deposit_to_missing_account_returns_not_found() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());
        let account_id = Uuid::new_v4();

        // Act
        let result =
            handle_deposit_funds(&deposit(account_id, dec!(10)), &f.clock, &f.accounts).await;

        // Assert
        assert!(matches!(result, Err(DomainError::AggregateNotFound(id)) if id == account_id));
    }

    #[tokio::test]
    async fn test_withdraw_beyond_balance_appends_nothing() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());
        let account_id = open(&f, dec!(10)).await;

        // Act
        let result = handle_withdraw_funds(
            &WithdrawFunds {
                correlation_id: Uuid::new_v4(),
                account_id,
                amount: dec!(10.01),
                description: None,
            },
            &f.clock,
            &f.accounts,
        )
        .await;

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(f.events.all_events().len(), 1);
    }

    #[tokio::test]
    async fn test_request_transfer_to_unknown_target_returns_not_found() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());
        let source = open(&f, dec!(10)).await;
        let target = Uuid::new_v4();

        // Act
        let result = handle_request_transfer(
            &RequestTransfer {
                correlation_id: Uuid::new_v4(),
                account_id: source,
                transfer_id: Uuid::new_v4(),
                target_account_id: target,
                amount: dec!(5),
            },
            &f.clock,
            &f.accounts,
        )
        .await;

        // Assert
        assert!(matches!(result, Err(DomainError::AggregateNotFound(id)) if id == target));
    }

    #[tokio::test]
    async fn test_transfer_out_and_reverse_carry_saga_correlation_id() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());
        let source = open(&f, dec!(50)).await;
        let saga_id = Uuid::new_v4();
        let transfer_id = Uuid::new_v4();

        // Act
        let debited = handle_transfer_out(
            &TransferOut {
                correlation_id: saga_id,
                account_id: source,
                transfer_id,
                target_account_id: Uuid::new_v4(),
                amount: dec!(20),
            },
            &f.clock,
            &f.accounts,
        )
        .await
        .unwrap();
        let reversed = handle_reverse_transfer(
            &ReverseTransfer {
                correlation_id: saga_id,
                account_id: source,
                transfer_id,
            },
            &f.clock,
            &f.accounts,
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(debited[0].event_type, FUNDS_TRANSFERRED_OUT_EVENT_TYPE);
        assert_eq!(debited[0].correlation_id, saga_id);
        assert_eq!(reversed[0].event_type, TRANSFER_REVERSED_EVENT_TYPE);
        assert_eq!(reversed[0].correlation_id, saga_id);
        let account = f.accounts.load(source).await.unwrap();
        assert_eq!(account.view().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_commit_crossing_threshold_takes_snapshot() {
        // Arrange
        let f = fixture(SnapshotPolicy::every(3));
        let account_id = open(&f, dec!(0)).await;

        // Act
        for _ in 0..3 {
            handle_deposit_funds(&deposit(account_id, dec!(1)), &f.clock, &f.accounts)
                .await
                .unwrap();
        }

        // Assert
        let completed = f.snapshots.completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].sequence_number, 3);
        assert_eq!(completed[0].state.body["balance"], "2");
    }

    #[tokio::test]
    async fn test_close_with_balance_is_rejected() {
        // Arrange
        let f = fixture(SnapshotPolicy::never());
        let account_id = open(&f, dec!(1)).await;

        // Act
        let result = handle_close_account(
            &CloseAccount {
                correlation_id: Uuid::new_v4(),
                account_id,
            },
            &f.clock,
            &f.accounts,
        )
        .await;

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(msg)) if msg.contains("non-zero")));
    }

    #[tokio::test]
    async fn test_store_failure_propagates_as_infrastructure_error() {
        // Arrange
        let accounts = account_rehydrator(
            Arc::new(FailingEventRepository),
            Arc::new(InMemorySnapshotRepository::new()),
            Arc::new(FixedClock::new_year()),
            SnapshotPolicy::never(),
        )
        .unwrap();

        // Act
        let result = handle_deposit_funds(
            &deposit(Uuid::new_v4(), dec!(1)),
            &FixedClock::new_year(),
            &accounts,
        )
        .await;

        // Assert
        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }
}
