//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, trace};

use crate::collector::SharedStats;
use crate::exposition;
use crate::store::SharedStore;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: SharedStore,
    stats: SharedStats,
}

/// Create the HTTP router.
pub fn router(store: SharedStore, stats: SharedStats, metrics_path: &str) -> Router {
    let state = AppState { store, stats };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the metrics endpoint.
///
/// Always 200: collection problems show up in the exporter health metrics.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.store.current();
    let stats = state.stats.stats();
    let body = exposition::render(snapshot.as_deref(), &stats);

    trace!(bytes = body.len(), has_snapshot = snapshot.is_some(), "Served metrics");

    (StatusCode::OK, [(CONTENT_TYPE, exposition::CONTENT_TYPE)], body).into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.store.has_snapshot() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no collection completed yet\n",
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    store: SharedStore,
    stats: SharedStats,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        store: SharedStore,
        stats: SharedStats,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            store,
            stats,
            listen_addr,
            metrics_path,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr().unwrap_or(self.listen_addr);
        let router = router(self.store, self.stats, &self.metrics_path);

        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
