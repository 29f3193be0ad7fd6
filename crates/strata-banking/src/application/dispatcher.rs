//! Generic command entry point.
//!
//! Routes `(aggregate_id, command_type, payload)` to the matching handler.
//! Domain refusals and concurrency conflicts come back as
//! `CommandOutcome::Rejected`; everything else is an error.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use strata_core::clock::Clock;
use strata_core::command::CommandOutcome;
use strata_core::error::DomainError;
use strata_core::repository::StoredEvent;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::application::command_handlers::{
    AccountRehydrator, handle_close_account, handle_deposit_funds, handle_open_account,
    handle_request_transfer, handle_withdraw_funds,
};
use crate::domain::commands::{
    CloseAccount, DepositFunds, OpenAccount, RequestTransfer, WithdrawFunds,
};

/// Command types accepted by [`submit_command`].
pub const COMMAND_TYPES: [&str; 5] = ["open", "deposit", "withdraw", "close", "request_transfer"];

#[derive(Deserialize)]
struct OpenPayload {
    account_holder: String,
    currency: String,
    #[serde(default)]
    initial_balance: Decimal,
    correlation_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct AmountPayload {
    amount: Decimal,
    description: Option<String>,
    correlation_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct TransferPayload {
    target_account_id: Uuid,
    amount: Decimal,
    transfer_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct ClosePayload {
    correlation_id: Option<Uuid>,
}

fn parse<T: DeserializeOwned>(
    command_type: &str,
    payload: serde_json::Value,
) -> Result<T, DomainError> {
    serde_json::from_value(payload)
        .map_err(|e| DomainError::Validation(format!("invalid `{command_type}` payload: {e}")))
}

/// Submits a command against a bank account.
///
/// A `null` payload is treated as an empty object.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an unknown command type or a
/// malformed payload, `DomainError::AggregateNotFound` if a required
/// account does not exist, and any store or decoding error.
#[instrument(skip(payload, clock, accounts))]
pub async fn submit_command(
    aggregate_id: Uuid,
    command_type: &str,
    payload: serde_json::Value,
    clock: &dyn Clock,
    accounts: &AccountRehydrator,
) -> Result<CommandOutcome, DomainError> {
    let payload = if payload.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        payload
    };

    let result = match command_type {
        "open" => {
            let p: OpenPayload = parse(command_type, payload)?;
            let command = OpenAccount {
                correlation_id: p.correlation_id.unwrap_or_else(Uuid::new_v4),
                account_id: aggregate_id,
                account_holder: p.account_holder,
                currency: p.currency,
                initial_balance: p.initial_balance,
            };
            handle_open_account(&command, clock, accounts).await
        }
        "deposit" => {
            let p: AmountPayload = parse(command_type, payload)?;
            let command = DepositFunds {
                correlation_id: p.correlation_id.unwrap_or_else(Uuid::new_v4),
                account_id: aggregate_id,
                amount: p.amount,
                description: p.description,
            };
            handle_deposit_funds(&command, clock, accounts).await
        }
        "withdraw" => {
            let p: AmountPayload = parse(command_type, payload)?;
            let command = WithdrawFunds {
                correlation_id: p.correlation_id.unwrap_or_else(Uuid::new_v4),
                account_id: aggregate_id,
                amount: p.amount,
                description: p.description,
            };
            handle_withdraw_funds(&command, clock, accounts).await
        }
        "request_transfer" => {
            let p: TransferPayload = parse(command_type, payload)?;
            let command = RequestTransfer {
                correlation_id: p.correlation_id.unwrap_or_else(Uuid::new_v4),
                account_id: aggregate_id,
                transfer_id: p.transfer_id.unwrap_or_else(Uuid::now_v7),
                target_account_id: p.target_account_id,
                amount: p.amount,
            };
            handle_request_transfer(&command, clock, accounts).await
        }
        "close" => {
            let p: ClosePayload = parse(command_type, payload)?;
            let command = CloseAccount {
                correlation_id: p.correlation_id.unwrap_or_else(Uuid::new_v4),
                account_id: aggregate_id,
            };
            handle_close_account(&command, clock, accounts).await
        }
        other => {
            return Err(DomainError::Validation(format!(
                "unknown command type `{other}`; expected one of {}",
                COMMAND_TYPES.join(", ")
            )));
        }
    };

    outcome(result)
}

fn outcome(result: Result<Vec<StoredEvent>, DomainError>) -> Result<CommandOutcome, DomainError> {
    match result {
        Ok(stored) => {
            let new_sequence = stored.last().map_or(0, |e| e.sequence_number);
            info!(new_sequence, events = stored.len(), "command accepted");
            Ok(CommandOutcome::Accepted {
                new_sequence,
                event_ids: stored.iter().map(|e| e.event_id).collect(),
            })
        }
        Err(e @ (DomainError::Validation(_) | DomainError::ConcurrencyConflict { .. })) => {
            info!(reason = %e, "command rejected");
            Ok(CommandOutcome::Rejected {
                reason: e.to_string(),
            })
        }
        Err(e) => Err(e),
    }
}
