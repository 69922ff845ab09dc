//! Stagehand Server - Main entry point

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use stagehand_common::logging::{init_logging, LogConfig};
use std::{net::SocketAddr, time::Duration};
use tokio::signal;
use tracing::info;

use stagehand_server::{
    config::{Config, DEFAULT_SERVER_HOST},
    ingress::{self, AppState},
    notifier::Notifier,
    warehouse::{manager::DriverRegistry, Orchestrator},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::default()
        .with_file_prefix("stagehand-server")
        .with_filter_directives("stagehand_server=debug,tower_http=debug,sqlx=info");

    // Merge with environment variables (they take precedence)
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    info!("Starting stagehand server");

    // Load configuration
    let config = Config::load()?;
    info!(
        mode = %config.warehouse.mode,
        port = config.warehouse.web_port,
        "Configuration loaded"
    );

    // Initialize metadata database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.jobs_db.max_connections)
        .acquire_timeout(Duration::from_secs(config.jobs_db.connect_timeout_secs))
        .connect(&config.jobs_db.url())
        .await?;

    info!("Metadata database connection pool established");

    // Run migrations; failure here is unrecoverable
    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    // Warehouse drivers are supplied by the embedding build; the registry is
    // the seam they plug into. Destination types without a driver stay
    // unrouted.
    let drivers = DriverRegistry::new();

    // Start the orchestrator for this mode
    let orchestrator = Orchestrator::new(config.clone(), db_pool.clone(), drivers);
    let _task_handles = orchestrator.start();

    // Build the ingress
    let state = AppState {
        store: orchestrator.store().clone(),
        notifier: Notifier::new(db_pool),
        hub: orchestrator.hub().clone(),
        mode: config.warehouse.mode,
    };
    let app = ingress::router(state);

    let addr: SocketAddr =
        format!("{}:{}", DEFAULT_SERVER_HOST, config.warehouse.web_port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.warehouse.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give in-flight requests time to complete
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
}
