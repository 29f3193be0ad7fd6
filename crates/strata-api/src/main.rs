//! Strata API server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use strata_api::config::Config;
use strata_api::error::AppError;
use strata_api::routes;
use strata_api::state::AppState;
use strata_api::telemetry;
use strata_banking::application::command_handlers::account_rehydrator;
use strata_banking::application::projections::AccountSummaryProjection;
use strata_banking::application::transaction_history::TransactionHistoryProjection;
use strata_banking::application::transfer_saga::TransferSagaTrigger;
use strata_banking::domain::schema::migration_plans;
use strata_core::bus::EventBus;
use strata_core::clock::{Clock, SystemClock};
use strata_core::migration::MigrationEngine;
use strata_core::projection::Projector;
use strata_core::saga::{SagaCoordinator, SagaReactor};
use strata_core::snapshot::SnapshotPolicy;
use strata_event_store::{
    PgEventRepository, PgMigrationStore, PgReadModelStore, PgSagaRepository,
    PgSnapshotRepository,
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let telemetry = telemetry::init(config.otlp_endpoint.as_deref())?;

    info!("starting Strata API server");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if config.run_migrations {
        let store = PgMigrationStore::new(pool.clone());
        let reports = MigrationEngine::new(&store, clock.as_ref())
            .run_all(&migration_plans()?)
            .await?;
        let applied: usize = reports.iter().map(|r| r.applied.len()).sum();
        info!(plans = reports.len(), applied, "document migrations complete");
    }

    let bus = EventBus::default();
    let events = Arc::new(PgEventRepository::new(pool.clone()).with_bus(bus.clone()));
    let read_models = Arc::new(PgReadModelStore::new(pool.clone()));
    let sagas = Arc::new(PgSagaRepository::new(pool.clone()));
    let accounts = Arc::new(account_rehydrator(
        events.clone(),
        Arc::new(PgSnapshotRepository::new(pool.clone())),
        clock.clone(),
        SnapshotPolicy::every(config.snapshot_every),
    )?);
    let account_summary = Arc::new(Projector::new(
        AccountSummaryProjection::new()?,
        events.clone(),
        read_models.clone(),
    ));
    let transaction_history = Arc::new(Projector::new(
        TransactionHistoryProjection::new()?,
        events.clone(),
        read_models.clone(),
    ));
    let coordinator = Arc::new(SagaCoordinator::new(
        sagas.clone(),
        events,
        bus.clone(),
        clock.clone(),
        config.saga_step_timeout,
    ));
    let reactor = SagaReactor::new(
        coordinator,
        TransferSagaTrigger::new(accounts.clone(), clock.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = config.projection_poll_interval;
    let summary_task = {
        let projector = Arc::clone(&account_summary);
        let bus = bus.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { projector.run(&bus, interval, shutdown).await })
    };
    let history_task = {
        let projector = Arc::clone(&transaction_history);
        let bus = bus.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { projector.run(&bus, interval, shutdown).await })
    };
    let reactor_task = tokio::spawn(async move { reactor.run(interval, shutdown_rx).await });

    let app_state = AppState::new(
        clock,
        accounts,
        read_models,
        sagas,
        account_summary,
        transaction_history,
    );

    // TODO: Replace CorsLayer::permissive() with restricted origins for production.
    let app = routes::app(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| std::io::Error::other(format!("invalid HOST:PORT combination: {e}")))?;
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped; draining background tasks");
    // Receivers may already be gone if a task exited early.
    let _ = shutdown_tx.send(true);
    let tasks = [
        ("account summary projector", summary_task),
        ("transaction history projector", history_task),
        ("saga reactor", reactor_task),
    ];
    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "background task panicked");
        }
    }

    pool.close().await;
    info!("database connections closed");
    telemetry.shutdown();

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
