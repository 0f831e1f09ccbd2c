//! Online Tracker - daily online time of devices on the local network.
//!
//! Probes each configured device on a fixed period, accumulates the minutes
//! it was reachable today and keeps that state in SQLite across restarts.

mod config;
mod db;
mod display;
mod presence;
mod probe;
mod scheduler;
mod tracker;
mod web;

use config::ServerConfig;
use db::Store;
use probe::Prober;
use scheduler::Scheduler;
use tracker::{ConfigError, Registry, Tracker};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("online_tracker=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting Online Tracker on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let registry = Arc::new(Registry::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        Prober::new(cfg.probe_timeout),
        cfg.poll_interval,
    ));
    let tracker = Arc::new(Tracker::new(store, registry.clone(), scheduler.clone()));

    tracker.resume().await?;

    for (name, target) in &cfg.seed_devices {
        match tracker.setup(name, target).await {
            Ok(_) => {}
            Err(ConfigError::DuplicateName(_)) => {
                tracing::debug!("Seed device {} already configured", name);
            }
            Err(e) => tracing::error!("Could not set up seed device {}: {}", name, e),
        }
    }

    tracing::info!("Tracking {} devices", registry.len().await);

    let server = Server::new(cfg, tracker);
    server.serve(shutdown_signal()).await?;

    tracing::info!("Shutting down");
    scheduler.stop_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
