//! HTTP endpoint serving the Prometheus scrape target.

use std::net::SocketAddr;

use axum::{extract::State, routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::irc::metrics::PrometheusSink;

pub fn build_router(sink: PrometheusSink) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(sink)
}

/// `GET /metrics`: Prometheus text exposition.
async fn metrics_handler(State(sink): State<PrometheusSink>) -> String {
    sink.render()
}

/// `GET /health`: liveness check.
async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}

pub async fn serve(
    listen: SocketAddr,
    sink: PrometheusSink,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("listening on http://{listen}");
    axum::serve(listener, build_router(sink)).await?;
    Ok(())
}
