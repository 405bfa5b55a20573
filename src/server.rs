// Scrape endpoint - serves the registry over HTTP
//
// GET /metrics renders the current registry in the text exposition format.
// GET /health always answers OK; it reflects the endpoint, not the devices.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::error;

use crate::metrics::MetricRegistry;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Builds the scrape router over a shared registry
pub fn router(registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

/// Metrics handler - returns the current snapshot
async fn metrics_handler(State(registry): State<Arc<MetricRegistry>>) -> impl IntoResponse {
    match registry.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "failed to render metrics\n".to_string(),
            )
        }
    }
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
