//! Aggregate roots for the Bank Account context.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strata_core::aggregate::AggregateRoot;
use strata_core::clock::Clock;
use strata_core::error::DomainError;
use strata_core::event::EventMetadata;
use uuid::Uuid;

use super::events::{
    AccountClosed, AccountOpened, BankAccountEvent, BankAccountEventKind, FundsDeposited,
    FundsTransferredIn, FundsTransferredOut, FundsWithdrawn, TransferRequested, TransferReversed,
};

/// Snapshot form of a bank account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccountState {
    /// Name of the account holder.
    pub account_holder: String,
    /// ISO currency code.
    pub currency: String,
    /// Current balance.
    pub balance: Decimal,
    /// Whether the account is closed.
    pub closed: bool,
    /// Amount debited per outgoing transfer.
    #[serde(default)]
    pub transfers_out: BTreeMap<Uuid, Decimal>,
    /// Incoming transfers already credited.
    #[serde(default)]
    pub transfers_in: BTreeSet<Uuid>,
    /// Outgoing transfers already refunded.
    #[serde(default)]
    pub reversed: BTreeSet<Uuid>,
}

/// The aggregate root for a bank account.
#[derive(Debug)]
pub struct BankAccount {
    /// Aggregate identifier.
    pub id: Uuid,
    /// Sequence number of the last applied event.
    pub(crate) version: i64,
    state: BankAccountState,
    /// Uncommitted events pending persistence.
    uncommitted_events: Vec<BankAccountEvent>,
}

fn require_positive(amount: Decimal, what: &str) -> Result<(), DomainError> {
    if amount <= Decimal::ZERO {
        return Err(DomainError::Validation(format!(
            "{what} amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

impl BankAccount {
    /// Returns the account's current state.
    #[must_use]
    pub fn view(&self) -> &BankAccountState {
        &self.state
    }

    /// Returns the next sequence number for a new event.
    #[allow(clippy::cast_possible_wrap)]
    fn next_sequence_number(&self) -> i64 {
        self.version + self.uncommitted_events.len() as i64 + 1
    }

    /// Balance including events not yet committed.
    fn pending_balance(&self) -> Decimal {
        self.uncommitted_events
            .iter()
            .fold(self.state.balance, |balance, event| match &event.kind {
                BankAccountEventKind::FundsDeposited(p) => balance + p.amount,
                BankAccountEventKind::FundsWithdrawn(p) => balance - p.amount,
                BankAccountEventKind::FundsTransferredOut(p) => balance - p.amount,
                BankAccountEventKind::FundsTransferredIn(p) => balance + p.amount,
                BankAccountEventKind::TransferReversed(p) => balance + p.amount,
                _ => balance,
            })
    }

    fn ensure_open(&self) -> Result<(), DomainError> {
        if self.version == 0 && self.uncommitted_events.is_empty() {
            return Err(DomainError::AggregateNotFound(self.id));
        }
        if self.state.closed {
            return Err(DomainError::Validation(format!(
                "account {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_funds(&self, amount: Decimal) -> Result<(), DomainError> {
        let balance = self.pending_balance();
        if balance < amount {
            return Err(DomainError::Validation(format!(
                "insufficient funds: balance={balance}, requested={amount}"
            )));
        }
        Ok(())
    }

    fn record(&mut self, kind: BankAccountEventKind, correlation_id: Uuid, clock: &dyn Clock) {
        let event = BankAccountEvent {
            metadata: EventMetadata {
                event_id: Uuid::new_v4(),
                event_type: kind.event_type().to_owned(),
                aggregate_id: self.id,
                sequence_number: self.next_sequence_number(),
                correlation_id,
                causation_id: correlation_id,
                occurred_at: clock.now(),
            },
            kind,
        };
        self.uncommitted_events.push(event);
    }

    /// Opens the account, producing an `AccountOpened` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account already exists, the
    /// holder or currency is blank, or the initial balance is negative.
    pub fn open(
        &mut self,
        account_holder: &str,
        currency: &str,
        initial_balance: Decimal,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        if self.version > 0 || !self.uncommitted_events.is_empty() {
            return Err(DomainError::Validation(format!(
                "account {} already exists",
                self.id
            )));
        }
        if account_holder.trim().is_empty() {
            return Err(DomainError::Validation(
                "account holder must not be empty".into(),
            ));
        }
        if currency.trim().is_empty() {
            return Err(DomainError::Validation("currency must not be empty".into()));
        }
        if initial_balance < Decimal::ZERO {
            return Err(DomainError::Validation(
                "initial balance cannot be negative".into(),
            ));
        }
        self.record(
            BankAccountEventKind::AccountOpened(AccountOpened {
                account_holder: account_holder.trim().to_owned(),
                currency: currency.trim().to_uppercase(),
                initial_balance,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Deposits funds, producing a `FundsDeposited` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account is closed or the
    /// amount is not positive.
    pub fn deposit(
        &mut self,
        amount: Decimal,
        description: Option<String>,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        require_positive(amount, "deposit")?;
        self.record(
            BankAccountEventKind::FundsDeposited(FundsDeposited {
                amount,
                description,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Withdraws funds, producing a `FundsWithdrawn` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account is closed, the
    /// amount is not positive, or the balance does not cover it.
    pub fn withdraw(
        &mut self,
        amount: Decimal,
        description: Option<String>,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        require_positive(amount, "withdrawal")?;
        self.ensure_funds(amount)?;
        self.record(
            BankAccountEventKind::FundsWithdrawn(FundsWithdrawn {
                amount,
                description,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Requests a transfer, producing a `TransferRequested` event. No money
    /// moves until the transfer saga debits the account.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account is closed, the
    /// target is this account, the amount is not positive, the balance does
    /// not cover it, or the transfer ID was already used.
    pub fn request_transfer(
        &mut self,
        transfer_id: Uuid,
        target_account_id: Uuid,
        amount: Decimal,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        if target_account_id == self.id {
            return Err(DomainError::Validation(
                "cannot transfer to the same account".into(),
            ));
        }
        require_positive(amount, "transfer")?;
        self.ensure_funds(amount)?;
        if self.state.transfers_out.contains_key(&transfer_id) {
            return Err(DomainError::Validation(format!(
                "transfer {transfer_id} already exists"
            )));
        }
        self.record(
            BankAccountEventKind::TransferRequested(TransferRequested {
                transfer_id,
                target_account_id,
                amount,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Debits the account for a transfer, producing a `FundsTransferredOut`
    /// event. A transfer that was already debited is left as is.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account is closed or the
    /// amount is not positive or not covered.
    pub fn transfer_out(
        &mut self,
        transfer_id: Uuid,
        target_account_id: Uuid,
        amount: Decimal,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        if self.state.transfers_out.contains_key(&transfer_id) {
            return Ok(());
        }
        self.ensure_open()?;
        require_positive(amount, "transfer")?;
        self.ensure_funds(amount)?;
        self.record(
            BankAccountEventKind::FundsTransferredOut(FundsTransferredOut {
                transfer_id,
                target_account_id,
                amount,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Credits the account for a transfer, producing a `FundsTransferredIn`
    /// event. A transfer that was already credited is left as is.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account is closed or the
    /// amount is not positive.
    pub fn transfer_in(
        &mut self,
        transfer_id: Uuid,
        source_account_id: Uuid,
        amount: Decimal,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        if self.state.transfers_in.contains(&transfer_id) {
            return Ok(());
        }
        self.ensure_open()?;
        require_positive(amount, "transfer")?;
        self.record(
            BankAccountEventKind::FundsTransferredIn(FundsTransferredIn {
                transfer_id,
                source_account_id,
                amount,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Refunds the debit of a failed transfer, producing a
    /// `TransferReversed` event.
    ///
    /// Allowed on a closed account. A transfer that was never debited, or
    /// was already reversed, is left as is.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the account was never
    /// opened.
    pub fn reverse_transfer(
        &mut self,
        transfer_id: Uuid,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        let Some(&amount) = self.state.transfers_out.get(&transfer_id) else {
            if self.version == 0 {
                return Err(DomainError::AggregateNotFound(self.id));
            }
            return Ok(());
        };
        if self.state.reversed.contains(&transfer_id) {
            return Ok(());
        }
        self.record(
            BankAccountEventKind::TransferReversed(TransferReversed {
                transfer_id,
                amount,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Closes the account, producing an `AccountClosed` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the account is already closed or
    /// its balance is not zero.
    pub fn close(&mut self, correlation_id: Uuid, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_open()?;
        let balance = self.pending_balance();
        if !balance.is_zero() {
            return Err(DomainError::Validation(format!(
                "cannot close account with non-zero balance: {balance}"
            )));
        }
        self.record(
            BankAccountEventKind::AccountClosed(AccountClosed {}),
            correlation_id,
            clock,
        );
        Ok(())
    }
}

impl AggregateRoot for BankAccount {
    type Event = BankAccountEvent;
    type State = BankAccountState;
    const AGGREGATE_TYPE: &'static str = "bank_account";

    fn empty(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: BankAccountState::default(),
            uncommitted_events: Vec::new(),
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &Self::Event) {
        let state = &mut self.state;
        match &event.kind {
            BankAccountEventKind::AccountOpened(p) => {
                state.account_holder.clone_from(&p.account_holder);
                state.currency.clone_from(&p.currency);
                state.balance = p.initial_balance;
                state.closed = false;
            }
            BankAccountEventKind::FundsDeposited(p) => state.balance += p.amount,
            BankAccountEventKind::FundsWithdrawn(p) => state.balance -= p.amount,
            BankAccountEventKind::TransferRequested(_) => {}
            BankAccountEventKind::FundsTransferredOut(p) => {
                state.balance -= p.amount;
                state.transfers_out.insert(p.transfer_id, p.amount);
            }
            BankAccountEventKind::FundsTransferredIn(p) => {
                state.balance += p.amount;
                state.transfers_in.insert(p.transfer_id);
            }
            BankAccountEventKind::TransferReversed(p) => {
                state.balance += p.amount;
                state.reversed.insert(p.transfer_id);
            }
            BankAccountEventKind::AccountClosed(_) => state.closed = true,
        }
        self.version = event.metadata.sequence_number;
    }

    fn uncommitted_events(&self) -> &[Self::Event] {
        &self.uncommitted_events
    }

    fn clear_uncommitted_events(&mut self) {
        self.uncommitted_events.clear();
    }

    fn state(&self) -> Self::State {
        self.state.clone()
    }

    fn restore(id: Uuid, version: i64, state: Self::State) -> Self {
        Self {
            id,
            version,
            state,
            uncommitted_events: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use strata_test_support::FixedClock;

    fn opened(balance: Decimal) -> BankAccount {
        let clock = FixedClock::new_year();
        let mut account = BankAccount::empty(Uuid::new_v4());
        account
            .open("Ada", "eur", balance, Uuid::new_v4(), &clock)
            .unwrap();
        commit_pending(&mut account);
        account
    }

    fn commit_pending(account: &mut BankAccount) {
        let events = account.uncommitted_events().to_vec();
        for event in &events {
            account.apply(event);
        }
        account.clear_uncommitted_events();
    }

    #[test]
    fn test_open_normalizes_currency_and_sets_balance() {
        let account = opened(dec!(100));

        assert_eq!(account.version(), 1);
        assert_eq!(account.view().currency, "EUR");
        assert_eq!(account.view().balance, dec!(100));
    }

    #[test]
    fn test_open_rejects_negative_initial_balance() {
        let mut account = BankAccount::empty(Uuid::new_v4());

        let result = account.open(
            "Ada",
            "EUR",
            dec!(-1),
            Uuid::new_v4(),
            &FixedClock::new_year(),
        );

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert!(account.uncommitted_events().is_empty());
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let mut account = opened(dec!(0));

        let result = account.open("Ada", "EUR", dec!(0), Uuid::new_v4(), &FixedClock::new_year());

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_deposit_on_unopened_account_is_not_found() {
        let id = Uuid::new_v4();
        let mut account = BankAccount::empty(id);

        let result = account.deposit(dec!(5), None, Uuid::new_v4(), &FixedClock::new_year());

        assert!(matches!(result, Err(DomainError::AggregateNotFound(found)) if found == id));
    }

    #[test]
    fn test_withdraw_checks_pending_balance() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(50));
        account
            .withdraw(dec!(30), None, Uuid::new_v4(), &clock)
            .unwrap();

        let result = account.withdraw(dec!(30), None, Uuid::new_v4(), &clock);

        assert!(matches!(
            result,
            Err(DomainError::Validation(msg)) if msg.contains("insufficient funds")
        ));
        assert_eq!(account.uncommitted_events().len(), 1);
        assert_eq!(account.uncommitted_events()[0].metadata.sequence_number, 2);
    }

    #[test]
    fn test_non_positive_amounts_are_rejected() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(50));

        assert!(account.deposit(dec!(0), None, Uuid::new_v4(), &clock).is_err());
        assert!(account.withdraw(dec!(-5), None, Uuid::new_v4(), &clock).is_err());
        assert!(account.uncommitted_events().is_empty());
    }

    #[test]
    fn test_closed_account_rejects_mutations() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(0));
        account.close(Uuid::new_v4(), &clock).unwrap();
        commit_pending(&mut account);

        assert!(account.deposit(dec!(1), None, Uuid::new_v4(), &clock).is_err());
        assert!(account.close(Uuid::new_v4(), &clock).is_err());
        assert!(
            account
                .transfer_in(Uuid::new_v4(), Uuid::new_v4(), dec!(1), Uuid::new_v4(), &clock)
                .is_err()
        );
    }

    #[test]
    fn test_close_requires_zero_balance() {
        let mut account = opened(dec!(0.01));

        let result = account.close(Uuid::new_v4(), &FixedClock::new_year());

        assert!(matches!(result, Err(DomainError::Validation(msg)) if msg.contains("non-zero")));
    }

    #[test]
    fn test_transfer_out_then_reverse_restores_balance_once() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(100));
        let transfer_id = Uuid::new_v4();
        account
            .transfer_out(transfer_id, Uuid::new_v4(), dec!(40), Uuid::new_v4(), &clock)
            .unwrap();
        commit_pending(&mut account);
        assert_eq!(account.view().balance, dec!(60));

        account
            .reverse_transfer(transfer_id, Uuid::new_v4(), &clock)
            .unwrap();
        commit_pending(&mut account);
        let again = account.reverse_transfer(transfer_id, Uuid::new_v4(), &clock);

        assert!(again.is_ok());
        assert!(account.uncommitted_events().is_empty());
        assert_eq!(account.view().balance, dec!(100));
    }

    #[test]
    fn test_replayed_transfer_out_debits_once() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(100));
        let transfer_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        account
            .transfer_out(transfer_id, target, dec!(40), Uuid::new_v4(), &clock)
            .unwrap();
        commit_pending(&mut account);

        let replay = account.transfer_out(transfer_id, target, dec!(40), Uuid::new_v4(), &clock);

        assert!(replay.is_ok());
        assert!(account.uncommitted_events().is_empty());
        assert_eq!(account.view().balance, dec!(60));
    }

    #[test]
    fn test_reverse_of_undebited_transfer_changes_nothing() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(100));

        let result = account.reverse_transfer(Uuid::new_v4(), Uuid::new_v4(), &clock);

        assert!(result.is_ok());
        assert!(account.uncommitted_events().is_empty());
        assert_eq!(account.view().balance, dec!(100));
    }

    #[test]
    fn test_replayed_transfer_in_credits_once() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(0));
        let transfer_id = Uuid::new_v4();
        account
            .transfer_in(transfer_id, Uuid::new_v4(), dec!(10), Uuid::new_v4(), &clock)
            .unwrap();
        commit_pending(&mut account);

        let result =
            account.transfer_in(transfer_id, Uuid::new_v4(), dec!(10), Uuid::new_v4(), &clock);

        assert!(result.is_ok());
        assert!(account.uncommitted_events().is_empty());
        assert_eq!(account.view().balance, dec!(10));
    }

    #[test]
    fn test_request_transfer_to_self_is_rejected() {
        let mut account = opened(dec!(10));
        let own_id = account.id;

        let result = account.request_transfer(
            Uuid::new_v4(),
            own_id,
            dec!(5),
            Uuid::new_v4(),
            &FixedClock::new_year(),
        );

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_request_transfer_does_not_move_money() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(10));

        account
            .request_transfer(Uuid::new_v4(), Uuid::new_v4(), dec!(5), Uuid::new_v4(), &clock)
            .unwrap();
        commit_pending(&mut account);

        assert_eq!(account.view().balance, dec!(10));
        assert_eq!(account.version(), 2);
    }

    #[test]
    fn test_state_round_trips_through_restore() {
        let clock = FixedClock::new_year();
        let mut account = opened(dec!(100));
        account
            .transfer_out(Uuid::new_v4(), Uuid::new_v4(), dec!(25), Uuid::new_v4(), &clock)
            .unwrap();
        commit_pending(&mut account);

        let restored = BankAccount::restore(account.id, account.version(), account.state());

        assert_eq!(restored.view(), account.view());
        assert_eq!(restored.version(), 2);
    }
}
