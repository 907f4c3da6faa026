//! Health check and metrics endpoints.

use axum::{Json, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::observability::metrics;

/// Liveness status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Always "healthy" when the process can answer.
    pub status: String,
    /// Service version
    pub version: String,
}

/// Liveness probe.
///
/// The reporter holds no connections between runs, so there is nothing to
/// check beyond the process answering.
#[tracing::instrument(name = "health.check")]
pub async fn health_check() -> impl IntoResponse {
    Json(HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus metrics endpoint.
pub async fn metrics() -> impl IntoResponse {
    match metrics::render() {
        Some(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}
