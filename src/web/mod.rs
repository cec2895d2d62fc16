//! Web server module.

mod error;
mod handlers;

pub use error::*;
pub use handlers::*;

use crate::config::ServerConfig;
use crate::feed::Publisher;
use crate::history::HistoryLog;
use crate::monitor::Registry;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub publisher: Arc<Publisher>,
    pub history: Arc<HistoryLog>,
}

/// Web server for the control API and live feed.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Targets
            .route(
                "/api/targets",
                get(handlers::handle_get_targets).post(handlers::handle_create_target),
            )
            .route(
                "/api/targets/{id}",
                put(handlers::handle_update_target).delete(handlers::handle_delete_target),
            )
            // Monitoring
            .route("/api/targets/{id}/start", post(handlers::handle_start))
            .route("/api/targets/{id}/stop", post(handlers::handle_stop))
            .route("/api/targets/{id}/probe", post(handlers::handle_probe))
            .route("/api/targets/{id}/snapshot", get(handlers::handle_snapshot))
            .route("/api/targets/{id}/sparkline", get(handlers::handle_sparkline))
            // Host history
            .route("/api/history/{metric}", get(handlers::handle_history))
            // Live feed
            .route("/ws/latency", get(handlers::handle_feed))
            .route("/ws/stats", get(handlers::handle_stats_feed))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(64 * 1024)) // 64KB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until Ctrl-C.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
