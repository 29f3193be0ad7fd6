//! Routes for bank accounts.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use strata_banking::application::dispatcher;
use strata_banking::application::projections::AccountSummary;
use strata_banking::application::query_handlers::{self, AccountView};
use strata_banking::application::transaction_history::TransactionHistory;
use strata_core::command::CommandOutcome;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /{id}/commands.
#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    /// One of the dispatcher's command types.
    pub command_type: String,
    /// Command-specific fields.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /{id}/commands
///
/// Accepted commands answer 200, rejected ones 422. Both carry the
/// `CommandOutcome`.
#[instrument(skip(state, request), fields(command_type = %request.command_type))]
async fn submit_command(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<SubmitCommandRequest>,
) -> Result<(StatusCode, Json<CommandOutcome>), ApiError> {
    info!(%account_id, "handling command");

    let outcome = dispatcher::submit_command(
        account_id,
        &request.command_type,
        request.payload,
        state.clock.as_ref(),
        &state.accounts,
    )
    .await?;

    let status = match outcome {
        CommandOutcome::Accepted { .. } => StatusCode::OK,
        CommandOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(outcome)))
}

/// GET /{id}
async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<AccountView>, ApiError> {
    let view = query_handlers::get_account_by_id(account_id, &state.accounts).await?;
    Ok(Json(view))
}

/// GET /{id}/summary
async fn get_account_summary(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<AccountSummary>, ApiError> {
    let summary =
        query_handlers::get_account_summary(account_id, state.read_models.as_ref()).await?;
    Ok(Json(summary))
}

/// GET /{id}/transactions
async fn get_transaction_history(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<TransactionHistory>, ApiError> {
    let history =
        query_handlers::get_transaction_history(account_id, state.read_models.as_ref()).await?;
    Ok(Json(history))
}

/// Returns the router for bank accounts.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_account))
        .route("/{id}/commands", post(submit_command))
        .route("/{id}/summary", get(get_account_summary))
        .route("/{id}/transactions", get(get_transaction_history))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::routes::test_state::{failing_state, in_memory_state};

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn command(account_id: Uuid, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/{account_id}/commands"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_open_command_returns_200_with_outcome() {
        // Arrange
        let app = router().with_state(in_memory_state());
        let account_id = Uuid::new_v4();
        let body = json!({
            "command_type": "open",
            "payload": {"account_holder": "Ada", "currency": "EUR", "initial_balance": "10"}
        });

        // Act
        let (status, json) = send(app, command(account_id, &body)).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["new_sequence"], 1);
        assert_eq!(json["event_ids"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_command_returns_422_with_reason() {
        // Arrange
        let state = in_memory_state();
        let account_id = Uuid::new_v4();
        let open = json!({
            "command_type": "open",
            "payload": {"account_holder": "Ada", "currency": "EUR"}
        });
        send(router().with_state(state.clone()), command(account_id, &open)).await;
        let withdraw = json!({"command_type": "withdraw", "payload": {"amount": "1"}});

        // Act
        let (status, json) =
            send(router().with_state(state), command(account_id, &withdraw)).await;

        // Assert
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["status"], "rejected");
        assert!(json["reason"].as_str().unwrap().contains("insufficient funds"));
    }

    #[tokio::test]
    async fn test_unknown_command_type_returns_400() {
        // Arrange
        let app = router().with_state(in_memory_state());
        let body = json!({"command_type": "freeze"});

        // Act
        let (status, json) = send(app, command(Uuid::new_v4(), &body)).await;

        // Assert
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_get_account_returns_rehydrated_view() {
        // Arrange
        let state = in_memory_state();
        let account_id = Uuid::new_v4();
        let open = json!({
            "command_type": "open",
            "payload": {"account_holder": "Ada", "currency": "eur", "initial_balance": "12.50"}
        });
        send(router().with_state(state.clone()), command(account_id, &open)).await;

        // Act
        let (status, json) = send(
            router().with_state(state),
            get_request(&format!("/{account_id}")),
        )
        .await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["account_id"], account_id.to_string());
        assert_eq!(json["currency"], "EUR");
        assert_eq!(json["balance"], "12.50");
        assert_eq!(json["version"], 1);
    }

    #[tokio::test]
    async fn test_get_summary_after_catch_up() {
        // Arrange
        let state = in_memory_state();
        let account_id = Uuid::new_v4();
        let open = json!({
            "command_type": "open",
            "payload": {"account_holder": "Ada", "currency": "EUR", "initial_balance": "3"}
        });
        send(router().with_state(state.clone()), command(account_id, &open)).await;
        state.account_summary.catch_up().await.unwrap();

        // Act
        let (status, json) = send(
            router().with_state(state),
            get_request(&format!("/{account_id}/summary")),
        )
        .await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["account_id"], account_id.to_string());
        assert_eq!(json["balance"], "3");
        assert_eq!(json["total_transactions"], 1);
    }

    #[tokio::test]
    async fn test_get_transactions_after_catch_up() {
        // Arrange
        let state = in_memory_state();
        let account_id = Uuid::new_v4();
        for body in [
            json!({
                "command_type": "open",
                "payload": {"account_holder": "Ada", "currency": "EUR", "initial_balance": "3"}
            }),
            json!({"command_type": "withdraw", "payload": {"amount": "1", "description": "tea"}}),
        ] {
            send(router().with_state(state.clone()), command(account_id, &body)).await;
        }
        state.transaction_history.catch_up().await.unwrap();

        // Act
        let (status, json) = send(
            router().with_state(state),
            get_request(&format!("/{account_id}/transactions")),
        )
        .await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["balance"], "2");
        assert_eq!(json["entries"][0]["transaction_type"], "opening");
        assert_eq!(json["entries"][1]["transaction_type"], "withdrawal");
        assert_eq!(json["entries"][1]["description"], "tea");
        assert_eq!(json["entries"][1]["balance_after"], "2");
    }

    #[tokio::test]
    async fn test_get_summary_before_projection_returns_404() {
        // Arrange
        let app = router().with_state(in_memory_state());

        // Act
        let (status, json) = send(app, get_request(&format!("/{}/summary", Uuid::new_v4()))).await;

        // Assert
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "aggregate_not_found");
    }

    #[tokio::test]
    async fn test_store_failure_returns_500() {
        // Arrange
        let app = router().with_state(failing_state());
        let body = json!({"command_type": "deposit", "payload": {"amount": "1"}});

        // Act
        let (status, json) = send(app, command(Uuid::new_v4(), &body)).await;

        // Assert
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "infrastructure_error");
    }
}
