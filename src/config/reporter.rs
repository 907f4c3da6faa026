use std::{collections::BTreeSet, str::FromStr, time::Duration};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::models::MetricNaming;

/// Settings for the daily cost aggregation job itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReporterConfig {
    /// IANA timezone the schedule runs in. "Yesterday" and the day boundaries
    /// of each query are computed in this zone.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Metric name written for every point.
    #[serde(default = "default_metric_name")]
    pub metric_name: String,

    /// Label key carrying the project identifier.
    #[serde(default = "default_label_key")]
    pub label_key: String,

    /// Label value of the grand-total point.
    #[serde(default = "default_total_label")]
    pub total_label: String,

    /// Currency reported when the ledger returns no rows.
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Only report these projects. Empty means every project.
    #[serde(default)]
    pub projects: BTreeSet<String>,

    /// Upper bound on the ledger query, in seconds.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Upper bound on the sink write, in seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            metric_name: default_metric_name(),
            label_key: default_label_key(),
            total_label: default_total_label(),
            default_currency: default_currency(),
            projects: BTreeSet::new(),
            query_timeout_secs: default_query_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_metric_name() -> String {
    "daily_cost".to_string()
}

fn default_label_key() -> String {
    "project".to_string()
}

fn default_total_label() -> String {
    "total".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_query_timeout() -> u64 {
    120
}

fn default_write_timeout() -> u64 {
    60
}

impl ReporterConfig {
    pub fn tz(&self) -> Result<Tz, String> {
        Tz::from_str(&self.timezone)
            .map_err(|e| format!("reporter.timezone '{}' is not a valid IANA zone: {e}", self.timezone))
    }

    pub fn naming(&self) -> MetricNaming {
        MetricNaming {
            metric: self.metric_name.clone(),
            label_key: self.label_key.clone(),
            total_label: self.total_label.clone(),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.tz()?;
        if self.metric_name.trim().is_empty() {
            return Err("reporter.metric_name must not be empty".into());
        }
        if self.label_key.trim().is_empty() {
            return Err("reporter.label_key must not be empty".into());
        }
        if self.total_label.trim().is_empty() {
            return Err("reporter.total_label must not be empty".into());
        }
        if self.projects.contains(&self.total_label) {
            return Err(format!(
                "reporter.projects contains '{}', which is reserved for the total",
                self.total_label
            ));
        }
        if self.default_currency.len() != 3 {
            return Err(format!(
                "reporter.default_currency '{}' is not a 3-letter currency code",
                self.default_currency
            ));
        }
        if self.query_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err("reporter timeouts must be greater than 0".into());
        }
        Ok(())
    }
}
