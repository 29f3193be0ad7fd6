//! Routes for saga inspection.
//!
//! Completed and cleanly compensated sagas are deleted by the coordinator,
//! so this mostly serves running sagas and ones parked after a failed
//! compensation.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use strata_core::error::DomainError;
use strata_core::saga::SagaInstance;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// GET /{id}
async fn get_saga(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<Json<SagaInstance>, ApiError> {
    let instance = state
        .sagas
        .load(saga_id)
        .await?
        .ok_or(DomainError::AggregateNotFound(saga_id))?;
    Ok(Json(instance))
}

/// Returns the router for sagas.
pub fn router() -> Router<AppState> {
    Router::new().route("/{id}", get(get_saga))
}
