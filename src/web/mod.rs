//! HTTP API.

mod handlers;

use crate::config::ServerConfig;
use crate::tracker::Tracker;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub tracker: Arc<Tracker>,
}

/// HTTP server exposing tracked devices.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, tracker: Arc<Tracker>) -> Self {
        Self {
            state: AppState { config, tracker },
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route(
                "/api/devices",
                get(handlers::handle_list_devices).post(handlers::handle_create_device),
            )
            .route(
                "/api/devices/{id}",
                get(handlers::handle_get_device).delete(handlers::handle_delete_device),
            )
            .route("/api/devices/{id}/status", get(handlers::handle_status))
            .route("/api/devices/{id}/online_time", get(handlers::handle_online_time))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("HTTP API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
