use serde::{Deserialize, Serialize};

use super::GcpCredentials;

/// Where metric points are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Google Cloud Monitoring custom metrics.
    CloudMonitoring(CloudMonitoringSinkConfig),

    /// Emit points as log events only. Nothing is persisted.
    Log,
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            SinkConfig::CloudMonitoring(config) => config.validate(),
            SinkConfig::Log => Ok(()),
        }
    }
}

/// Maximum time series per `timeSeries.create` call.
pub const MAX_MONITORING_BATCH: usize = 200;

/// Cloud Monitoring sink configuration.
///
/// ```toml
/// [sink]
/// type = "cloud_monitoring"
/// project = "my-monitoring-project"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudMonitoringSinkConfig {
    /// Project that owns the metric and its alert policies.
    pub project: String,

    /// Prefix joined with the metric name to form the metric type.
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,

    /// Monitored resource type attached to every series.
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    /// Time series per write request (1..=200).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Create the metric descriptor on first use if it is missing.
    #[serde(default = "default_true")]
    pub ensure_descriptor: bool,

    /// Credentials used to call the Monitoring API.
    #[serde(default)]
    pub credentials: GcpCredentials,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// API base URL override (tests, emulators).
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_metric_prefix() -> String {
    "custom.googleapis.com/billing/".to_string()
}

fn default_resource_type() -> String {
    "global".to_string()
}

fn default_batch_size() -> usize {
    MAX_MONITORING_BATCH
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

impl CloudMonitoringSinkConfig {
    /// Full metric type for a metric name, e.g.
    /// `custom.googleapis.com/billing/daily_cost`.
    pub fn metric_type(&self, metric: &str) -> String {
        if self.metric_prefix.is_empty() || self.metric_prefix.ends_with('/') {
            format!("{}{}", self.metric_prefix, metric)
        } else {
            format!("{}/{}", self.metric_prefix, metric)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.project.trim().is_empty() {
            return Err("sink.project must not be empty".into());
        }
        if !(1..=MAX_MONITORING_BATCH).contains(&self.batch_size) {
            return Err(format!(
                "sink.batch_size must be between 1 and {MAX_MONITORING_BATCH}, got {}",
                self.batch_size
            ));
        }
        if self.timeout_secs == 0 {
            return Err("sink.timeout_secs must be greater than 0".into());
        }
        self.credentials.validate("sink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitoring(toml_str: &str) -> CloudMonitoringSinkConfig {
        match toml::from_str(toml_str).unwrap() {
            SinkConfig::CloudMonitoring(config) => config,
            SinkConfig::Log => panic!("expected cloud_monitoring"),
        }
    }

    #[test]
    fn test_parse_defaults() {
        let config = monitoring(
            r#"
            type = "cloud_monitoring"
            project = "mon-proj"
        "#,
        );
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.resource_type, "global");
        assert!(config.ensure_descriptor);
        assert_eq!(
            config.metric_type("daily_cost"),
            "custom.googleapis.com/billing/daily_cost"
        );
    }

    #[test]
    fn test_metric_type_without_trailing_slash() {
        let config = monitoring(
            r#"
            type = "cloud_monitoring"
            project = "mon-proj"
            metric_prefix = "custom.googleapis.com/finance"
        "#,
        );
        assert_eq!(
            config.metric_type("daily_cost"),
            "custom.googleapis.com/finance/daily_cost"
        );
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut config = monitoring(
            r#"
            type = "cloud_monitoring"
            project = "mon-proj"
        "#,
        );
        config.batch_size = 0;
        assert!(config.validate().is_err());
        config.batch_size = 201;
        assert!(config.validate().is_err());
        config.batch_size = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_log_sink() {
        let config: SinkConfig = toml::from_str(r#"type = "log""#).unwrap();
        assert!(matches!(config, SinkConfig::Log));
    }
}
