pub mod error;
pub mod health;
pub mod trigger;

use axum::{
    Router,
    routing::{any, get},
};
pub use error::{ApiError, ErrorInfo, ErrorResponse};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{AppState, config::CostwatchConfig, middleware::http_metrics_middleware};

/// Build the HTTP router.
///
/// `/` runs the report for any method so schedulers that only know how to
/// send GET or POST can both trigger it.
pub fn build_app(config: &CostwatchConfig, state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", any(trigger::trigger))
        .route("/health", get(health::health_check));

    if config.observability.metrics.enabled {
        app = app.route("/metrics", get(health::metrics));
    }

    app.layer(axum::middleware::from_fn(http_metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::body::Body;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use rust_decimal::dec;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        ledger::CostLedger,
        models::CostRow,
        reporter::{CostReporter, ReporterSettings},
        sink::MetricSink,
        test_utils::{FakeLedger, InMemorySink, LogCapture, SlowLedger},
    };

    const CONFIG: &str = r#"
[ledger]
type = "bigquery"
project = "billing-proj"
table = "billing.gcp_billing_export_v1"

[sink]
type = "log"
"#;

    fn app_with(
        ledger: Arc<dyn CostLedger>,
        sink: Arc<dyn MetricSink>,
        request_timeout: Duration,
        metrics_enabled: bool,
    ) -> Router {
        let mut config = CostwatchConfig::from_str(CONFIG).unwrap();
        config.observability.metrics.enabled = metrics_enabled;
        let reporter = CostReporter::new(ledger, sink, ReporterSettings::default());
        let state = AppState {
            reporter: Arc::new(reporter),
            request_timeout,
        };
        build_app(&config, state)
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn rows() -> Vec<CostRow> {
        vec![
            CostRow::new("proj-a", dec!(12.50), "USD"),
            CostRow::new("proj-b", dec!(7.25), "USD"),
        ]
    }

    #[tokio::test]
    async fn test_post_runs_report_for_requested_date() {
        let sink = Arc::new(InMemorySink::default());
        let app = app_with(
            Arc::new(FakeLedger::new(rows())),
            sink.clone(),
            Duration::from_secs(30),
            false,
        );

        let (status, body) = send(app, "POST", "/?date=2024-05-01").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["date"], "2024-05-01");
        assert_eq!(body["points_written"], 3);
        assert_eq!(body["projects"]["proj-a"], "12.50");
        assert_eq!(body["total"], "19.75");
        assert_eq!(sink.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_get_also_triggers() {
        let sink = Arc::new(InMemorySink::default());
        let app = app_with(
            Arc::new(FakeLedger::new(rows())),
            sink.clone(),
            Duration::from_secs(30),
            false,
        );

        let (status, _) = send(app, "GET", "/?date=2024-05-01").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(sink.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_date_is_bad_request() {
        let sink = Arc::new(InMemorySink::default());
        let app = app_with(
            Arc::new(FakeLedger::new(rows())),
            sink.clone(),
            Duration::from_secs(30),
            false,
        );

        let (status, body) = send(app, "POST", "/?date=yesterday").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_date");
        assert_eq!(sink.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_billing_data_is_unprocessable() {
        let sink = Arc::new(InMemorySink::default());
        let ledger = FakeLedger::new(vec![
            CostRow::new("proj-a", dec!(3), "USD"),
            CostRow::new("proj-b", dec!(-1), "USD"),
        ]);
        let app = app_with(Arc::new(ledger), sink.clone(), Duration::from_secs(30), false);

        let (status, body) = send(app, "POST", "/?date=2024-05-01").await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["type"], "validation_error");
        assert_eq!(body["error"]["code"], "invalid_billing_data");
        assert_eq!(sink.write_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_gateway_timeout() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let sink = Arc::new(InMemorySink::default());
        let app = app_with(
            Arc::new(SlowLedger::new(Duration::from_secs(3600))),
            sink.clone(),
            Duration::from_secs(5),
            false,
        );

        let (status, body) = send(app, "POST", "/?date=2024-05-01").await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"]["type"], "timeout_error");
        assert_eq!(body["error"]["code"], "request_timeout");
        assert_eq!(sink.write_calls(), 0);

        let output = logs.contents();
        assert!(output.contains("Daily cost report failed"), "{output}");
        assert!(output.contains("timeout_error"), "{output}");
    }

    #[tokio::test]
    async fn test_health() {
        let app = app_with(
            Arc::new(FakeLedger::new(Vec::new())),
            Arc::new(InMemorySink::default()),
            Duration::from_secs(30),
            false,
        );

        let (status, body) = send(app, "GET", "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_metrics_route_absent_when_disabled() {
        let app = app_with(
            Arc::new(FakeLedger::new(Vec::new())),
            Arc::new(InMemorySink::default()),
            Duration::from_secs(30),
            false,
        );

        let (status, _) = send(app, "GET", "/metrics").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
