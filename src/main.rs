//! PingMeDaddy - network telemetry service.
//!
//! Continuously pings a fleet of IP targets, stores the samples in a
//! three-level time-series store, and serves analytics over an
//! authenticated HTTP API.

mod analytics;
mod auth;
mod config;
mod db;
mod probe;
mod registry;
mod scheduler;
mod web;

use analytics::Analytics;
use config::AppConfig;
use db::Store;
use registry::Registry;
use scheduler::{RetentionManager, RollupManager, Scheduler};
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pingmedaddy=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = Arc::new(AppConfig::load());
    tracing::info!("Starting PingMeDaddy on port {}...", cfg.app_port);
    tracing::info!("Using database at {}", cfg.database_url);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.database_url)?);
    tracing::info!("Database initialized successfully");

    // Wire the collaborators
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        cfg.ping_concurrency_limit,
        Duration::from_secs(cfg.ping_timeout),
    ));
    let registry = Arc::new(Registry::new(store.clone(), scheduler.clone()));
    let analytics = Analytics::new(store.clone());

    // Probe loops come up before the API accepts traffic.
    scheduler.start().await?;

    let rollup = RollupManager::new(store.clone());
    rollup.start();
    let retention = RetentionManager::new(store.clone());
    retention.start();

    // Serve until ctrl-c, then drain.
    let server = Server::new(
        cfg.clone(),
        store.clone(),
        scheduler.clone(),
        registry,
        analytics,
    );
    server.start(shutdown_signal()).await?;

    rollup.stop().await;
    retention.stop().await;
    scheduler.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}
