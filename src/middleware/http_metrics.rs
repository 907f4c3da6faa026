use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};

use crate::observability::metrics;

/// Record method, route and status for every request.
///
/// The route template is used as the path label so query strings and unknown
/// paths do not create new series.
pub async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start_time = std::time::Instant::now();

    let response = next.run(req).await;

    let duration = start_time.elapsed();
    let status = response.status().as_u16();
    metrics::record_http_request(&method, &path, status, duration.as_secs_f64());

    tracing::debug!(
        method = %method,
        path = %path,
        status,
        duration_ms = duration.as_millis() as u64,
        "request completed"
    );

    response
}
