//! Call Signaling maintenance service
//!
//! Runs schema migrations and the stale session sweeper against the shared
//! Postgres store, and exposes Prometheus metrics.

use call_signaling::config::Config;
use call_signaling::observability::init_metrics_recorder;
use call_signaling::registry::CallRegistry;
use call_signaling::store::PgSessionStore;
use call_signaling::tasks::{start_stale_session_sweeper, SweeperConfig};
use common::secret::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the sweeper gets to finish its current pass on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first; the log format depends on it.
    let config = Config::from_env()?;

    init_tracing(&config.observability.log_filter, config.observability.json_logs);

    info!("Starting Call Signaling maintenance service");
    info!(
        db_max_connections = config.db_max_connections,
        stale_session_ttl_seconds = config.stale_session_ttl.as_secs(),
        sweep_interval_seconds = config.sweep_interval.as_secs(),
        metrics_bind_address = %config.metrics_bind_address,
        "Configuration loaded successfully"
    );

    init_metrics_recorder(config.metrics_bind_address).map_err(|e| {
        error!("Failed to initialize metrics recorder: {}", e);
        e
    })?;

    info!("Connecting to database...");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;
    info!("Database connection established");

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            e
        })?;
    info!("Migrations applied");

    let registry = CallRegistry::new(Arc::new(PgSessionStore::new(pool.clone())));
    let cancel_token = CancellationToken::new();

    let sweeper = tokio::spawn(
        start_stale_session_sweeper(
            registry,
            SweeperConfig {
                ttl: config.stale_session_ttl,
                interval: config.sweep_interval,
            },
            cancel_token.clone(),
        )
        .instrument(tracing::info_span!("signaling.sweeper")),
    );

    shutdown_signal().await;
    cancel_token.cancel();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, sweeper).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Sweeper task failed: {}", e),
        Err(_) => error!("Sweeper did not stop within {:?}", SHUTDOWN_TIMEOUT),
    }

    pool.close().await;
    info!("Call Signaling shutdown complete");

    Ok(())
}

fn init_tracing(default_filter: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
