//! Prometheus metrics for the reporter.
//!
//! Provides metrics for:
//! - Report runs by outcome and their latency
//! - Ledger rows read and points written
//! - HTTP requests to the trigger endpoint

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &seconds_from_ms(&config.latency_buckets_ms),
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

/// Convert millisecond buckets to seconds.
#[cfg(feature = "prometheus")]
fn seconds_from_ms(ms_buckets: &[f64]) -> Vec<f64> {
    ms_buckets.iter().map(|ms| ms / 1000.0).collect()
}

/// Get the Prometheus handle for rendering metrics.
#[cfg(feature = "prometheus")]
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render the current metrics in Prometheus exposition format, if a
/// recorder is installed.
pub fn render() -> Option<String> {
    #[cfg(feature = "prometheus")]
    {
        get_prometheus_handle().map(|handle| handle.render())
    }
    #[cfg(not(feature = "prometheus"))]
    {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        let status_class = format!("{}xx", status / 100);

        counter!("costwatch_http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string(), "status_class" => status_class.clone())
            .increment(1);

        histogram!("costwatch_http_request_duration_seconds", "method" => method.to_string(), "path" => path.to_string(), "status_class" => status_class)
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (method, path, status, duration_secs);
    }
}

/// Record a finished report run.
///
/// # Arguments
/// * `outcome` - "success", "query_error", "validation_error" or "write_error"
/// * `duration_secs` - Wall time of the whole run
pub fn record_report_run(outcome: &str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("costwatch_report_runs_total", "outcome" => outcome.to_string()).increment(1);
        histogram!("costwatch_report_duration_seconds", "outcome" => outcome.to_string())
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (outcome, duration_secs);
    }
}

/// Record rows returned by a ledger query.
pub fn record_ledger_rows(ledger: &str, rows: usize) {
    #[cfg(feature = "prometheus")]
    {
        counter!("costwatch_ledger_rows_total", "ledger" => ledger.to_string())
            .increment(rows as u64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (ledger, rows);
    }
}

/// Record points accepted by a sink.
pub fn record_points_written(sink: &str, points: usize) {
    #[cfg(feature = "prometheus")]
    {
        counter!("costwatch_points_written_total", "sink" => sink.to_string())
            .increment(points as u64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (sink, points);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
