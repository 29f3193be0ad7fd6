//! Commands for the Bank Account context.

use rust_decimal::Decimal;
use strata_core::command::Command;
use uuid::Uuid;

/// Command to open an account.
#[derive(Debug, Clone)]
pub struct OpenAccount {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The account identifier.
    pub account_id: Uuid,
    /// Name of the account holder.
    pub account_holder: String,
    /// ISO currency code.
    pub currency: String,
    /// Opening balance.
    pub initial_balance: Decimal,
}

/// Command to deposit funds.
#[derive(Debug, Clone)]
pub struct DepositFunds {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The account identifier.
    pub account_id: Uuid,
    /// Amount to deposit.
    pub amount: Decimal,
    /// Free-form description.
    pub description: Option<String>,
}

/// Command to withdraw funds.
#[derive(Debug, Clone)]
pub struct WithdrawFunds {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The account identifier.
    pub account_id: Uuid,
    /// Amount to withdraw.
    pub amount: Decimal,
    /// Free-form description.
    pub description: Option<String>,
}

/// Command to request a transfer to another account.
#[derive(Debug, Clone)]
pub struct RequestTransfer {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The source account identifier.
    pub account_id: Uuid,
    /// The transfer identifier.
    pub transfer_id: Uuid,
    /// The account to credit.
    pub target_account_id: Uuid,
    /// Amount to move.
    pub amount: Decimal,
}

/// Command to debit the source account of a transfer.
#[derive(Debug, Clone)]
pub struct TransferOut {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The source account identifier.
    pub account_id: Uuid,
    /// The transfer identifier.
    pub transfer_id: Uuid,
    /// The account being credited.
    pub target_account_id: Uuid,
    /// Amount to debit.
    pub amount: Decimal,
}

/// Command to credit the target account of a transfer.
#[derive(Debug, Clone)]
pub struct TransferIn {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The target account identifier.
    pub account_id: Uuid,
    /// The transfer identifier.
    pub transfer_id: Uuid,
    /// The account that was debited.
    pub source_account_id: Uuid,
    /// Amount to credit.
    pub amount: Decimal,
}

/// Command to refund the debit of a failed transfer.
#[derive(Debug, Clone)]
pub struct ReverseTransfer {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The source account identifier.
    pub account_id: Uuid,
    /// The transfer identifier.
    pub transfer_id: Uuid,
}

/// Command to close an account.
#[derive(Debug, Clone)]
pub struct CloseAccount {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The account identifier.
    pub account_id: Uuid,
}

macro_rules! impl_command {
    ($($ty:ident => $name:literal),* $(,)?) => {
        $(
            impl Command for $ty {
                fn command_type(&self) -> &'static str {
                    $name
                }

                fn correlation_id(&self) -> Uuid {
                    self.correlation_id
                }

                fn aggregate_id(&self) -> Uuid {
                    self.account_id
                }
            }
        )*
    };
}

impl_command! {
    OpenAccount => "open",
    DepositFunds => "deposit",
    WithdrawFunds => "withdraw",
    RequestTransfer => "request_transfer",
    TransferOut => "transfer_out",
    TransferIn => "transfer_in",
    ReverseTransfer => "reverse_transfer",
    CloseAccount => "close",
}
