//! The `account_summary` read model.
//!
//! One record per account, keyed by the account ID, carrying the balance
//! and per-kind transaction counts.

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
use crate::domain::schema::{ACCOUNT_SUMMARY_PROJECTION, account_summary_plan, event_registry};

/// Stored body of an `account_summary` record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSummaryBody {
    /// Name of the account holder.
    pub account_holder: String,
    /// ISO currency code.
    pub currency: String,
    /// Projected balance.
    pub balance: Decimal,
    /// Number of deposits.
    pub deposits: u64,
    /// Number of withdrawals.
    pub withdrawals: u64,
    /// Number of transfer debits.
    pub transfers_out: u64,
    /// Number of transfer credits.
    pub transfers_in: u64,
    /// Number of refunded transfer debits.
    pub reversals: u64,
    /// Every balance-affecting event plus opening and closing.
    pub total_transactions: u64,
    /// Whether the account is closed.
    pub closed: bool,
    /// Timestamp of the last projected event.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Sequence number of the last projected event.
    pub projected_version: i64,
}

/// A projected account summary as served to queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    /// The account identifier.
    pub account_id: Uuid,
    /// Projected fields.
    #[serde(flatten)]
    pub body: AccountSummaryBody,
}

impl AccountSummary {
    /// Decodes a stored record body.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the body is malformed.
    pub fn from_body(account_id: Uuid, body: Document) -> Result<Self, DomainError> {
        let body = serde_json::from_value(body).map_err(|e| {
            DomainError::Infrastructure(format!("malformed account summary {account_id}: {e}"))
        })?;
        Ok(Self { account_id, body })
    }
}

/// Folds bank account events into `account_summary` records.
pub struct AccountSummaryProjection {
    plan: MigrationPlan,
    registry: EventRegistry<BankAccountEventKind>,
}

impl AccountSummaryProjection {
    /// Creates the projection.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidPlan` if an event plan is malformed.
    pub fn new() -> Result<Self, MigrationError> {
        Ok(Self {
            plan: account_summary_plan(),
            registry: event_registry()?,
        })
    }
}

impl Projection for AccountSummaryProjection {
    fn name(&self) -> &'static str {
        ACCOUNT_SUMMARY_PROJECTION
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
        serde_json::to_value(AccountSummaryBody::default()).unwrap_or_default()
    }

    fn apply(&self, body: &mut Document, event: &StoredEvent) -> Result<(), DomainError> {
        let kind = self.registry.decode(
            &event.event_type,
            event.schema_version,
            event.payload.clone(),
        )?;
        let mut summary: AccountSummaryBody = serde_json::from_value(body.clone())
            .map_err(|e| DomainError::Infrastructure(format!("malformed account summary: {e}")))?;

        let counted = match kind {
            BankAccountEventKind::AccountOpened(p) => {
                summary.account_holder = p.account_holder;
                summary.currency = p.currency;
                summary.balance = p.initial_balance;
                true
            }
            BankAccountEventKind::FundsDeposited(p) => {
                summary.balance += p.amount;
                summary.deposits += 1;
                true
            }
            BankAccountEventKind::FundsWithdrawn(p) => {
                summary.balance -= p.amount;
                summary.withdrawals += 1;
                true
            }
            BankAccountEventKind::TransferRequested(_) => false,
            BankAccountEventKind::FundsTransferredOut(p) => {
                summary.balance -= p.amount;
                summary.transfers_out += 1;
                true
            }
            BankAccountEventKind::FundsTransferredIn(p) => {
                summary.balance += p.amount;
                summary.transfers_in += 1;
                true
            }
            BankAccountEventKind::TransferReversed(p) => {
                summary.balance += p.amount;
                summary.reversals += 1;
                true
            }
            BankAccountEventKind::AccountClosed(_) => {
                summary.closed = true;
                true
            }
        };
        if counted {
            summary.total_transactions += 1;
        }
        summary.last_activity_at = Some(event.occurred_at);
        summary.projected_version = event.sequence_number;

        *body = serde_json::to_value(&summary)
            .map_err(|e| DomainError::Infrastructure(format!("account summary encoding: {e}")))?;
        Ok(())
    }
}
