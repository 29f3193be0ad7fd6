//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sqlx::PgPool;
use strata_api::routes;
use strata_api::state::AppState;
use strata_banking::application::command_handlers::account_rehydrator;
use strata_banking::application::projections::AccountSummaryProjection;
use strata_banking::application::transaction_history::TransactionHistoryProjection;
use strata_banking::application::transfer_saga::TransferSagaTrigger;
use strata_core::bus::EventBus;
use strata_core::clock::Clock;
use strata_core::projection::Projector;
use strata_core::saga::{SagaCoordinator, SagaReactor};
use strata_core::snapshot::SnapshotPolicy;
use strata_event_store::{
    PgEventRepository, PgReadModelStore, PgSagaRepository, PgSnapshotRepository,
};
use strata_test_support::FixedClock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Fixed timestamp used across all integration tests.
fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(
        chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 1, 15, 10, 0, 0).unwrap(),
    ))
}

/// PostgreSQL-backed application wiring, the same as `main.rs` builds it.
pub struct TestHarness {
    pub state: AppState,
    events: Arc<PgEventRepository>,
    bus: EventBus,
    pool: PgPool,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl TestHarness {
    pub fn new(pool: PgPool) -> Self {
        let clock = fixed_clock();
        let bus = EventBus::default();
        let events = Arc::new(PgEventRepository::new(pool.clone()).with_bus(bus.clone()));
        let read_models = Arc::new(PgReadModelStore::new(pool.clone()));
        let accounts = account_rehydrator(
            events.clone(),
            Arc::new(PgSnapshotRepository::new(pool.clone())),
            clock.clone(),
            SnapshotPolicy::every(3),
        )
        .unwrap();
        let account_summary = Projector::new(
            AccountSummaryProjection::new().unwrap(),
            events.clone(),
            read_models.clone(),
        );
        let transaction_history = Projector::new(
            TransactionHistoryProjection::new().unwrap(),
            events.clone(),
            read_models.clone(),
        );
        let state = AppState::new(
            clock,
            Arc::new(accounts),
            read_models,
            Arc::new(PgSagaRepository::new(pool.clone())),
            Arc::new(account_summary),
            Arc::new(transaction_history),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            state,
            events,
            bus,
            pool,
            shutdown,
            workers: Vec::new(),
        }
    }

    /// The full application router.
    pub fn app(&self) -> Router {
        routes::app(self.state.clone())
    }

    /// Starts both projectors and the transfer saga reactor, giving them a
    /// moment to subscribe to the bus.
    pub async fn spawn_workers(&mut self) {
        let coordinator = Arc::new(SagaCoordinator::new(
            self.state.sagas.clone(),
            self.events.clone(),
            self.bus.clone(),
            self.state.clock.clone(),
            Duration::from_secs(5),
        ));
        let reactor = SagaReactor::new(
            coordinator,
            TransferSagaTrigger::new(self.state.accounts.clone(), self.state.clock.clone()),
        );
        let shutdown = self.shutdown.subscribe();
        self.workers.push(tokio::spawn(async move {
            reactor.run(Duration::from_millis(50), shutdown).await;
        }));

        let projector = Arc::clone(&self.state.account_summary);
        let bus = self.bus.clone();
        let shutdown = self.shutdown.subscribe();
        self.workers.push(tokio::spawn(async move {
            projector
                .run(&bus, Duration::from_millis(50), shutdown)
                .await;
        }));

        let projector = Arc::clone(&self.state.transaction_history);
        let bus = self.bus.clone();
        let shutdown = self.shutdown.subscribe();
        self.workers.push(tokio::spawn(async move {
            projector
                .run(&bus, Duration::from_millis(50), shutdown)
                .await;
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Stops the workers, waiting for in-flight sagas.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        for worker in self.workers {
            worker.await.unwrap();
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Polls `uri` until `predicate` holds or two seconds pass.
pub async fn eventually<F>(app: &Router, uri: &str, predicate: F) -> serde_json::Value
where
    F: Fn(StatusCode, &serde_json::Value) -> bool,
{
    for _ in 0..40 {
        let (status, json) = get_json(app.clone(), uri).await;
        if predicate(status, &json) {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition on {uri} never held");
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, json)
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, json)
}

/// Submit a command to an account.
pub async fn submit(
    app: &Router,
    account_id: uuid::Uuid,
    command_type: &str,
    payload: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    post_json(
        app.clone(),
        &format!("/api/v1/accounts/{account_id}/commands"),
        &serde_json::json!({ "command_type": command_type, "payload": payload }),
    )
    .await
}
