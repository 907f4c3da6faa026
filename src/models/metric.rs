use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single value destined for the metrics sink.
///
/// Labels are kept in a sorted map so two points built from the same report
/// serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    /// Day the value describes. Sinks map this to a concrete timestamp.
    pub date: NaiveDate,
}

/// Identity of a point in the sink: everything except the value.
///
/// Writing two points with the same key must overwrite, not accumulate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub metric: String,
    pub labels: Vec<(String, String)>,
    pub date: NaiveDate,
}

impl MetricPoint {
    pub fn new(
        metric: impl Into<String>,
        label_key: impl Into<String>,
        label_value: impl Into<String>,
        value: f64,
        date: NaiveDate,
    ) -> Self {
        Self {
            metric: metric.into(),
            labels: BTreeMap::from([(label_key.into(), label_value.into())]),
            value,
            date,
        }
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey {
            metric: self.metric.clone(),
            labels: self
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            date: self.date,
        }
    }

    /// Value of a label, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Naming used when turning a report into metric points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNaming {
    /// Metric name shared by every point (e.g. `daily_cost`).
    pub metric: String,
    /// Label carrying the project identifier (e.g. `project`).
    pub label_key: String,
    /// Label value used for the grand-total point (e.g. `total`).
    pub total_label: String,
}

impl Default for MetricNaming {
    fn default() -> Self {
        Self {
            metric: "daily_cost".to_string(),
            label_key: "project".to_string(),
            total_label: "total".to_string(),
        }
    }
}
