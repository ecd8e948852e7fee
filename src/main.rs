//! Message hub service.
//!
//! Main entry point of one hub process. Loads configuration and the service
//! manifest, connects the coordination store, runs the delivery pipeline
//! next to the HTTP API and shuts both down gracefully.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hub_api::{AppState, Config, StoreBackend};
use hub_core::{
    storage::{MemoryStore, PostgresStore},
    Clock, CoordinationStore, Manifest, RealClock,
};
use hub_delivery::Hub;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting message hub");
    info!(
        store_backend = ?config.store_backend,
        database_url = %config.database_url_masked(),
        manifest_path = %config.manifest_path.display(),
        polling_interval_ms = config.polling_interval_ms,
        "Configuration loaded"
    );

    let manifest = Manifest::load(&config.manifest_path, config.default_concurrency)
        .with_context(|| format!("Failed to load manifest {}", config.manifest_path.display()))?;
    info!(
        services = manifest.len(),
        subscribers = manifest.subscribers().count(),
        "Manifest loaded"
    );

    let store = create_store(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let hub = Arc::new(
        Hub::new(manifest, store.clone(), clock.clone(), config.to_hub_config())
            .context("Failed to build hub")?,
    );
    hub.start().await;
    info!(process_id = %hub.process_id(), "Delivery pipeline running");

    let addr = config.parse_server_addr()?;
    let state = AppState::new(hub.clone(), clock);
    if let Err(e) =
        hub_api::start_server(state, addr, Duration::from_secs(config.request_timeout)).await
    {
        error!(error = %e, "Server failed");
    }

    if let Err(e) = hub.shutdown().await {
        warn!(error = %e, "Hub did not shut down cleanly");
    }

    info!("Message hub shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects the configured coordination store.
async fn create_store(config: &Config) -> Result<Arc<dyn CoordinationStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store, queues are lost on exit and not shared between processes");
            Ok(Arc::new(MemoryStore::new()))
        },
        StoreBackend::Postgres => {
            let pool = create_database_pool(config).await?;
            info!("Database connection pool established");

            let store = PostgresStore::new(pool);
            store.migrate().await.context("Failed to run database migrations")?;
            info!("Database migrations completed");
            Ok(Arc::new(store))
        },
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
