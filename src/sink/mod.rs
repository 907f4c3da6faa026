//! Metric sink abstraction for pluggable metric destinations.
//!
//! ## Available Sinks
//!
//! - **CloudMonitoringSink**: Writes GAUGE points to Cloud Monitoring custom metrics
//! - **LogSink**: Logs each point and stores nothing (dry runs, local development)
//!
//! Writing the same points twice must leave the sink in the same state as
//! writing them once: a point is identified by metric, labels and day, and a
//! rewrite replaces the earlier value.

mod log;
mod monitoring;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono_tz::Tz;
pub use log::LogSink;
pub use monitoring::CloudMonitoringSink;

use crate::{config::SinkConfig, gcp::AuthError, models::MetricPoint};

/// Trait for metric sinks.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Write a batch of points.
    ///
    /// Returns the number of points written. Any rejected point fails the
    /// whole call.
    async fn write_batch(&self, points: &[MetricPoint]) -> Result<usize, SinkError>;

    /// Get the sink name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Errors from metric sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink rejected {} point(s) with HTTP {status}: {message}", failed_labels.len())]
    Rejected {
        status: u16,
        message: String,
        /// Label values of the points in the rejected request.
        failed_labels: Vec<String>,
    },

    #[error("write did not complete within {0:?}")]
    Timeout(Duration),
}

impl SinkError {
    pub fn is_timeout(&self) -> bool {
        match self {
            SinkError::Timeout(_) => true,
            SinkError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Build the configured sink. `tz` is the reporting timezone, used to place
/// each daily point at the end of its day.
pub fn from_config(config: &SinkConfig, tz: Tz, http_client: reqwest::Client) -> Arc<dyn MetricSink> {
    match config {
        SinkConfig::CloudMonitoring(config) => {
            Arc::new(CloudMonitoringSink::from_config(config, tz, http_client))
        }
        SinkConfig::Log => Arc::new(LogSink),
    }
}
