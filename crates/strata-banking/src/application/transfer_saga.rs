//! The `transfer` saga.
//!
//! A `TransferRequested` event on the source account starts the saga:
//!
//! 1. `debit_source` issues `transfer_out` on the source and waits for
//!    `funds_transferred_out`. Compensated by `reverse_transfer`.
//! 2. `credit_target` issues `transfer_in` on the target and waits for
//!    `funds_transferred_in`.
//!
//! Commands are issued with the saga ID as correlation ID, which is how
//! the coordinator recognises the confirming events. Replaying a command
//! for a transfer the account already recorded changes nothing, so a
//! resumed saga can safely dispatch a step again.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use strata_core::aggregate::AggregateRoot;
use strata_core::clock::Clock;
use strata_core::error::DomainError;
use strata_core::repository::StoredEvent;
use strata_core::saga::{AwaitedEvent, SagaDefinition, SagaStep, SagaTrigger};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::command_handlers::{
    AccountRehydrator, handle_reverse_transfer, handle_transfer_in, handle_transfer_out,
};
use crate::domain::aggregates::BankAccount;
use crate::domain::commands::{ReverseTransfer, TransferIn, TransferOut};
use crate::domain::events::{
    BankAccountEventKind, FUNDS_TRANSFERRED_IN_EVENT_TYPE, FUNDS_TRANSFERRED_OUT_EVENT_TYPE,
    TRANSFER_REQUESTED_EVENT_TYPE,
};

/// Saga type name of transfers.
pub const TRANSFER_SAGA_TYPE: &str = "transfer";

/// Conflicting writes a step absorbs before failing.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Runs `attempt` again while it fails with a concurrency conflict.
async fn with_conflict_retry<F, Fut>(mut attempt: F) -> Result<Vec<StoredEvent>, DomainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<StoredEvent>, DomainError>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_retryable() && retries < MAX_CONFLICT_RETRIES => {
                retries += 1;
                debug!(retries, error = %e, "retrying transfer command after conflict");
            }
            result => return result,
        }
    }
}

#[derive(Clone)]
struct Transfer {
    transfer_id: Uuid,
    source_account_id: Uuid,
    target_account_id: Uuid,
    amount: Decimal,
    accounts: Arc<AccountRehydrator>,
    clock: Arc<dyn Clock>,
}

struct DebitSource(Transfer);

#[async_trait]
impl SagaStep for DebitSource {
    fn name(&self) -> &'static str {
        "debit_source"
    }

    fn awaits(&self, saga_id: Uuid) -> AwaitedEvent {
        AwaitedEvent {
            aggregate_id: self.0.source_account_id,
            event_type: FUNDS_TRANSFERRED_OUT_EVENT_TYPE.to_owned(),
            correlation_id: saga_id,
        }
    }

    async fn execute(&self, saga_id: Uuid) -> Result<(), DomainError> {
        let t = &self.0;
        let command = TransferOut {
            correlation_id: saga_id,
            account_id: t.source_account_id,
            transfer_id: t.transfer_id,
            target_account_id: t.target_account_id,
            amount: t.amount,
        };
        with_conflict_retry(|| handle_transfer_out(&command, t.clock.as_ref(), &t.accounts))
            .await?;
        Ok(())
    }

    async fn compensate(&self, saga_id: Uuid) -> Result<(), DomainError> {
        let t = &self.0;
        let command = ReverseTransfer {
            correlation_id: saga_id,
            account_id: t.source_account_id,
            transfer_id: t.transfer_id,
        };
        with_conflict_retry(|| handle_reverse_transfer(&command, t.clock.as_ref(), &t.accounts))
            .await?;
        Ok(())
    }
}

struct CreditTarget(Transfer);

#[async_trait]
impl SagaStep for CreditTarget {
    fn name(&self) -> &'static str {
        "credit_target"
    }

    fn awaits(&self, saga_id: Uuid) -> AwaitedEvent {
        AwaitedEvent {
            aggregate_id: self.0.target_account_id,
            event_type: FUNDS_TRANSFERRED_IN_EVENT_TYPE.to_owned(),
            correlation_id: saga_id,
        }
    }

    async fn execute(&self, saga_id: Uuid) -> Result<(), DomainError> {
        let t = &self.0;
        let command = TransferIn {
            correlation_id: saga_id,
            account_id: t.target_account_id,
            transfer_id: t.transfer_id,
            source_account_id: t.source_account_id,
            amount: t.amount,
        };
        with_conflict_retry(|| handle_transfer_in(&command, t.clock.as_ref(), &t.accounts))
            .await?;
        Ok(())
    }
}

/// Starts a `transfer` saga for every `TransferRequested` event.
pub struct TransferSagaTrigger {
    accounts: Arc<AccountRehydrator>,
    clock: Arc<dyn Clock>,
}

impl TransferSagaTrigger {
    /// Creates the trigger. Saga steps issue their commands through
    /// `accounts`.
    #[must_use]
    pub fn new(accounts: Arc<AccountRehydrator>, clock: Arc<dyn Clock>) -> Self {
        Self { accounts, clock }
    }
}

impl SagaTrigger for TransferSagaTrigger {
    fn saga_type(&self) -> &'static str {
        TRANSFER_SAGA_TYPE
    }

    fn saga_for(&self, event: &StoredEvent) -> Option<SagaDefinition> {
        if event.aggregate_type != BankAccount::AGGREGATE_TYPE
            || event.event_type != TRANSFER_REQUESTED_EVENT_TYPE
        {
            return None;
        }
        let requested = match self.accounts.decode_event(event) {
            Ok(decoded) => match decoded.kind {
                BankAccountEventKind::TransferRequested(requested) => requested,
                _ => return None,
            },
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "undecodable transfer request");
                return None;
            }
        };

        let transfer = Transfer {
            transfer_id: requested.transfer_id,
            source_account_id: event.aggregate_id,
            target_account_id: requested.target_account_id,
            amount: requested.amount,
            accounts: Arc::clone(&self.accounts),
            clock: Arc::clone(&self.clock),
        };
        Some(SagaDefinition {
            saga_type: TRANSFER_SAGA_TYPE.to_owned(),
            correlated_aggregate_ids: vec![event.aggregate_id, requested.target_account_id],
            steps: vec![
                Box::new(DebitSource(transfer.clone())),
                Box::new(CreditTarget(transfer)),
            ],
        })
    }
}
