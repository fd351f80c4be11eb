//! HTTP endpoint exposing `/metrics` and `/health`.

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use super::prometheus::metrics_handler;

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "avai-dispatch",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Builds the metrics router.
pub fn create_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
}

/// Serves the metrics router until a shutdown signal arrives.
///
/// Fails if `addr` cannot be bound.
pub async fn serve(addr: &str, mut shutdown_rx: broadcast::Receiver<()>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Metrics endpoint listening");

    axum::serve(listener, create_router())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
}
