//! Pingboard - live latency monitoring for network links.

mod config;
mod db;
mod display;
mod feed;
mod history;
mod host;
mod monitor;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use feed::Publisher;
use history::HistoryLog;
use host::HostMonitor;
use monitor::{NewTarget, Registry};
use scheduler::Scheduler;
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingboard=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Pingboard on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!("Probe mode: {:?}, interval {:?}", cfg.probe_mode, cfg.probe_interval);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let registry = Arc::new(Registry::new(store, cfg.latency_window));

    // Add sample target if none exist
    if registry.list_targets()?.is_empty() {
        tracing::info!("Adding sample target: Google DNS");
        registry.add_target(NewTarget {
            name: "Google DNS".to_string(),
            address: "8.8.8.8".to_string(),
            ..Default::default()
        })?;
    }

    let prober = probe::build_prober(&cfg);
    let scheduler = Arc::new(Scheduler::new(registry.clone(), prober, cfg.probe_interval));
    if cfg.autostart {
        scheduler.start_all().await?;
    }

    let publisher = Arc::new(Publisher::new(registry.clone(), cfg.viewer_buffer));
    let publish_task = publisher.clone().start(cfg.publish_interval);

    let history = Arc::new(HistoryLog::new(cfg.history_dir.clone(), cfg.history_capacity));
    let host_task = HostMonitor::new(history.clone(), publisher.clone())
        .start(cfg.host_stats_interval, cfg.history_interval);

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        registry,
        scheduler: scheduler.clone(),
        publisher,
        history,
    });
    server.start().await?;

    publish_task.abort();
    host_task.abort();
    scheduler.shutdown().await;
    tracing::info!("Pingboard stopped");

    Ok(())
}
