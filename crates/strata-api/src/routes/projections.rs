//! Routes for read-model maintenance.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use strata_core::projection::Projection;
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::state::AppState;

/// Response body of a rebuild.
#[derive(Debug, Serialize)]
pub struct RebuildResponse {
    /// The rebuilt projection.
    pub projection: &'static str,
    /// Events replayed.
    pub processed: usize,
}

/// POST /account-summary/rebuild
///
/// Clears the `account_summary` records and replays the whole event log.
#[instrument(skip(state))]
async fn rebuild_account_summary(
    State(state): State<AppState>,
) -> Result<Json<RebuildResponse>, ApiError> {
    let processed = state.account_summary.rebuild().await?;
    let projection = state.account_summary.projection().name();
    info!(projection, processed, "rebuild requested over HTTP");
    Ok(Json(RebuildResponse {
        projection,
        processed,
    }))
}

/// POST /transaction-history/rebuild
///
/// Clears the `transaction_history` records and replays the whole event log.
#[instrument(skip(state))]
async fn rebuild_transaction_history(
    State(state): State<AppState>,
) -> Result<Json<RebuildResponse>, ApiError> {
    let processed = state.transaction_history.rebuild().await?;
    let projection = state.transaction_history.projection().name();
    info!(projection, processed, "rebuild requested over HTTP");
    Ok(Json(RebuildResponse {
        projection,
        processed,
    }))
}

/// Returns the router for projections.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/account-summary/rebuild", post(rebuild_account_summary))
        .route("/transaction-history/rebuild", post(rebuild_transaction_history))
}
