//! HTTP routes.

use axum::Router;

use crate::state::AppState;

pub mod accounts;
pub mod health;
pub mod projections;
pub mod sagas;

/// Builds the full application router. Shared by `main` and the tests;
/// `main` adds the HTTP layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/api/v1/accounts", accounts::router())
        .nest("/api/v1/sagas", sagas::router())
        .nest("/api/v1/projections", projections::router())
        .with_state(state)
}
