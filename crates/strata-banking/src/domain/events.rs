//! Domain events for the Bank Account context.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strata_core::event::{DomainEvent, EventEnvelope, EventMetadata};
use uuid::Uuid;

/// Event type for `AccountOpened`.
pub const ACCOUNT_OPENED_EVENT_TYPE: &str = "bank_account.opened";
/// Event type for `FundsDeposited`.
pub const FUNDS_DEPOSITED_EVENT_TYPE: &str = "bank_account.funds_deposited";
/// Event type for `FundsWithdrawn`.
pub const FUNDS_WITHDRAWN_EVENT_TYPE: &str = "bank_account.funds_withdrawn";
/// Event type for `TransferRequested`.
pub const TRANSFER_REQUESTED_EVENT_TYPE: &str = "bank_account.transfer_requested";
/// Event type for `FundsTransferredOut`.
pub const FUNDS_TRANSFERRED_OUT_EVENT_TYPE: &str = "bank_account.funds_transferred_out";
/// Event type for `FundsTransferredIn`.
pub const FUNDS_TRANSFERRED_IN_EVENT_TYPE: &str = "bank_account.funds_transferred_in";
/// Event type for `TransferReversed`.
pub const TRANSFER_REVERSED_EVENT_TYPE: &str = "bank_account.transfer_reversed";
/// Event type for `AccountClosed`.
pub const ACCOUNT_CLOSED_EVENT_TYPE: &str = "bank_account.closed";

/// Emitted when an account is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    /// Name of the account holder.
    pub account_holder: String,
    /// ISO currency code.
    pub currency: String,
    /// Opening balance.
    pub initial_balance: Decimal,
}

/// Emitted when funds are deposited.
///
/// Schema v1 stored the amount under `amt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsDeposited {
    /// Amount deposited.
    pub amount: Decimal,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Emitted when funds are withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsWithdrawn {
    /// Amount withdrawn.
    pub amount: Decimal,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Emitted on the source account when a transfer is requested. Starts the
/// transfer saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequested {
    /// Transfer identifier.
    pub transfer_id: Uuid,
    /// Account to credit.
    pub target_account_id: Uuid,
    /// Amount to move.
    pub amount: Decimal,
}

/// Emitted when the source account is debited for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsTransferredOut {
    /// Transfer identifier.
    pub transfer_id: Uuid,
    /// Account being credited.
    pub target_account_id: Uuid,
    /// Amount debited.
    pub amount: Decimal,
}

/// Emitted when the target account is credited for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsTransferredIn {
    /// Transfer identifier.
    pub transfer_id: Uuid,
    /// Account that was debited.
    pub source_account_id: Uuid,
    /// Amount credited.
    pub amount: Decimal,
}

/// Emitted when a debit is refunded because the transfer failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReversed {
    /// Transfer identifier.
    pub transfer_id: Uuid,
    /// Amount refunded.
    pub amount: Decimal,
}

/// Emitted when an account is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClosed {}

/// Event payload variants for the Bank Account context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankAccountEventKind {
    /// The account was opened.
    AccountOpened(AccountOpened),
    /// Funds were deposited.
    FundsDeposited(FundsDeposited),
    /// Funds were withdrawn.
    FundsWithdrawn(FundsWithdrawn),
    /// A transfer out of the account was requested.
    TransferRequested(TransferRequested),
    /// The account was debited for a transfer.
    FundsTransferredOut(FundsTransferredOut),
    /// The account was credited by a transfer.
    FundsTransferredIn(FundsTransferredIn),
    /// A transfer debit was refunded.
    TransferReversed(TransferReversed),
    /// The account was closed.
    AccountClosed(AccountClosed),
}

impl BankAccountEventKind {
    /// Returns the stored event type of this variant.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AccountOpened(_) => ACCOUNT_OPENED_EVENT_TYPE,
            Self::FundsDeposited(_) => FUNDS_DEPOSITED_EVENT_TYPE,
            Self::FundsWithdrawn(_) => FUNDS_WITHDRAWN_EVENT_TYPE,
            Self::TransferRequested(_) => TRANSFER_REQUESTED_EVENT_TYPE,
            Self::FundsTransferredOut(_) => FUNDS_TRANSFERRED_OUT_EVENT_TYPE,
            Self::FundsTransferredIn(_) => FUNDS_TRANSFERRED_IN_EVENT_TYPE,
            Self::TransferReversed(_) => TRANSFER_REVERSED_EVENT_TYPE,
            Self::AccountClosed(_) => ACCOUNT_CLOSED_EVENT_TYPE,
        }
    }
}

/// Domain event envelope for the Bank Account context.
#[derive(Debug, Clone)]
pub struct BankAccountEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: BankAccountEventKind,
}

fn payload<T: Serialize>(value: &T) -> serde_json::Value {
    // Serialization of derived Serialize types to Value is infallible.
    serde_json::to_value(value).expect("bank account event serialization is infallible")
}

impl DomainEvent for BankAccountEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn to_payload(&self) -> serde_json::Value {
        match &self.kind {
            BankAccountEventKind::AccountOpened(p) => payload(p),
            BankAccountEventKind::FundsDeposited(p) => payload(p),
            BankAccountEventKind::FundsWithdrawn(p) => payload(p),
            BankAccountEventKind::TransferRequested(p) => payload(p),
            BankAccountEventKind::FundsTransferredOut(p) => payload(p),
            BankAccountEventKind::FundsTransferredIn(p) => payload(p),
            BankAccountEventKind::TransferReversed(p) => payload(p),
            BankAccountEventKind::AccountClosed(p) => payload(p),
        }
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

impl EventEnvelope for BankAccountEvent {
    type Kind = BankAccountEventKind;

    fn from_parts(metadata: EventMetadata, kind: Self::Kind) -> Self {
        Self { metadata, kind }
    }
}
