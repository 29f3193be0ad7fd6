//! Shared application state.

use std::sync::Arc;

use strata_banking::application::command_handlers::AccountRehydrator;
use strata_banking::application::projections::AccountSummaryProjection;
use strata_banking::application::transaction_history::TransactionHistoryProjection;
use strata_core::clock::Clock;
use strata_core::projection::{Projector, ReadModelStore};
use strata_core::saga::SagaRepository;

/// Application state shared across all request handlers.
///
/// Holds trait objects only, so handlers run unchanged against the
/// PostgreSQL stores or in-memory ones.
#[derive(Clone)]
pub struct AppState {
    /// Clock for event timestamps.
    pub clock: Arc<dyn Clock>,
    /// Loads and commits bank accounts.
    pub accounts: Arc<AccountRehydrator>,
    /// Read-model records.
    pub read_models: Arc<dyn ReadModelStore>,
    /// Persisted saga instances.
    pub sagas: Arc<dyn SagaRepository>,
    /// The `account_summary` projector, shared with the background task.
    pub account_summary: Arc<Projector<AccountSummaryProjection>>,
    /// The `transaction_history` projector, shared with the background task.
    pub transaction_history: Arc<Projector<TransactionHistoryProjection>>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        accounts: Arc<AccountRehydrator>,
        read_models: Arc<dyn ReadModelStore>,
        sagas: Arc<dyn SagaRepository>,
        account_summary: Arc<Projector<AccountSummaryProjection>>,
        transaction_history: Arc<Projector<TransactionHistoryProjection>>,
    ) -> Self {
        Self {
            clock,
            accounts,
            read_models,
            sagas,
            account_summary,
            transaction_history,
        }
    }
}
