//! Google Cloud Monitoring sink.
//!
//! Points become GAUGE/DOUBLE custom metric time series. The metric
//! descriptor is created on first use when missing; writes go through
//! `projects.timeSeries.create` in chunks of at most 200 series.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{MetricSink, SinkError};
use crate::{
    config::{CloudMonitoringSinkConfig, MAX_MONITORING_BATCH},
    gcp::{TokenProvider, api_error_message, token_provider, with_bearer},
    models::{CostQuery, MetricPoint},
};

const DEFAULT_BASE_URL: &str = "https://monitoring.googleapis.com/v3";

/// Error text Cloud Monitoring uses when a series already holds a point at or
/// after the end time being written.
const OUT_OF_ORDER_MARKERS: [&str; 2] = [
    "Points must be written in order",
    "older start time than the most recent point",
];

/// Stored values keyed by metric labels.
type StoredValues = HashMap<BTreeMap<String, String>, f64>;

pub struct CloudMonitoringSink {
    project: String,
    config: CloudMonitoringSinkConfig,
    base_url: String,
    tz: Tz,
    timeout: Duration,
    tokens: Arc<dyn TokenProvider>,
    client: reqwest::Client,
    /// Metric types whose descriptor is known to exist.
    ensured: Mutex<HashSet<String>>,
}

impl CloudMonitoringSink {
    pub fn from_config(config: &CloudMonitoringSinkConfig, tz: Tz, client: reqwest::Client) -> Self {
        Self {
            project: config.project.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            tz,
            timeout: Duration::from_secs(config.timeout_secs),
            tokens: token_provider(&config.credentials),
            client,
            ensured: Mutex::new(HashSet::new()),
            config: config.clone(),
        }
    }

    /// End of the reported day in the reporting timezone. Identical for every
    /// write of the same day, so a rewrite lands on the same point.
    fn end_time(&self, point: &MetricPoint) -> DateTime<Utc> {
        CostQuery::for_day(point.date, self.tz, None).end
    }

    fn format_time(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn time_series(&self, point: &MetricPoint) -> TimeSeries {
        let mut resource_labels = BTreeMap::new();
        if self.config.resource_type == "global" {
            resource_labels.insert("project_id".to_string(), self.project.clone());
        }

        TimeSeries {
            metric: Metric {
                kind: self.config.metric_type(&point.metric),
                labels: point.labels.clone(),
            },
            resource: MonitoredResource {
                kind: self.config.resource_type.clone(),
                labels: resource_labels,
            },
            metric_kind: "GAUGE",
            value_type: "DOUBLE",
            points: [Point {
                interval: TimeInterval {
                    end_time: Self::format_time(self.end_time(point)),
                },
                value: TypedValue {
                    double_value: point.value,
                },
            }],
        }
    }

    /// Make sure a descriptor exists for every metric in `points`. Failures
    /// are logged and otherwise ignored; the write itself reports real
    /// problems.
    async fn ensure_descriptors(&self, points: &[MetricPoint]) {
        let mut wanted: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for point in points {
            wanted
                .entry(point.metric.as_str())
                .or_default()
                .extend(point.labels.keys().map(String::as_str));
        }

        let mut ensured = self.ensured.lock().await;
        for (metric, label_keys) in wanted {
            let metric_type = self.config.metric_type(metric);
            if ensured.contains(&metric_type) {
                continue;
            }
            match self.ensure_descriptor(&metric_type, metric, &label_keys).await {
                Ok(()) => {
                    ensured.insert(metric_type);
                }
                Err(e) => {
                    tracing::warn!(
                        metric_type = %metric_type,
                        error = %e,
                        "Failed to ensure metric descriptor; writing anyway"
                    );
                }
            }
        }
    }

    async fn ensure_descriptor(
        &self,
        metric_type: &str,
        metric: &str,
        label_keys: &BTreeSet<&str>,
    ) -> Result<(), SinkError> {
        let token = self.tokens.token().await?;
        let url = format!(
            "{}/projects/{}/metricDescriptors/{}",
            self.base_url, self.project, metric_type
        );
        let response = with_bearer(self.client.get(&url), &token)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(metric_type, "Metric descriptor already exists");
            return Ok(());
        }
        if status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                message: api_error_message(&body),
                failed_labels: Vec::new(),
            });
        }

        tracing::info!(metric_type, "Metric descriptor not found, creating");
        let descriptor = MetricDescriptor {
            kind: metric_type.to_string(),
            metric_kind: "GAUGE",
            value_type: "DOUBLE",
            display_name: format!("Daily cost ({metric})"),
            description: "Daily cost per project, from the billing export".to_string(),
            labels: label_keys
                .iter()
                .map(|key| LabelDescriptor {
                    key: key.to_string(),
                    value_type: "STRING",
                })
                .collect(),
        };
        let url = format!("{}/projects/{}/metricDescriptors", self.base_url, self.project);
        let response = with_bearer(self.client.post(&url), &token)
            .timeout(self.timeout)
            .json(&descriptor)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                message: api_error_message(&body),
                failed_labels: Vec::new(),
            });
        }
        tracing::info!(metric_type, "Created metric descriptor");
        Ok(())
    }

    async fn write_chunk(&self, chunk: &[MetricPoint]) -> Result<(), SinkError> {
        let body = CreateTimeSeriesRequest {
            time_series: chunk.iter().map(|p| self.time_series(p)).collect(),
        };
        let url = format!("{}/projects/{}/timeSeries", self.base_url, self.project);
        let token = self.tokens.token().await?;
        let response = with_bearer(self.client.post(&url), &token)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST
            && OUT_OF_ORDER_MARKERS.iter().any(|m| body.contains(m))
        {
            return self.reconcile_chunk(chunk, status.as_u16(), &body).await;
        }

        let failed_labels: Vec<String> = chunk
            .iter()
            .flat_map(|p| p.labels.values().cloned())
            .collect();
        tracing::error!(
            status = status.as_u16(),
            failed_labels = ?failed_labels,
            "Cloud Monitoring rejected time series"
        );
        Err(SinkError::Rejected {
            status: status.as_u16(),
            message: api_error_message(&body),
            failed_labels,
        })
    }

    /// Settle an out-of-order rejection by reading back what is stored.
    ///
    /// Cloud Monitoring points cannot be rewritten, so a rerun for a day that
    /// was already written is rejected. A point whose series already holds a
    /// point at the same end time counts as written. Anything else (usually a
    /// newer day already present in the series) is a real failure.
    async fn reconcile_chunk(
        &self,
        chunk: &[MetricPoint],
        status: u16,
        body: &str,
    ) -> Result<(), SinkError> {
        let wanted: BTreeSet<(&str, NaiveDate)> = chunk
            .iter()
            .map(|p| (p.metric.as_str(), p.date))
            .collect();
        let mut stored: HashMap<(&str, NaiveDate), StoredValues> = HashMap::new();
        for (metric, date) in wanted {
            let end = CostQuery::for_day(date, self.tz, None).end;
            stored.insert((metric, date), self.stored_values(metric, end).await?);
        }

        let mut failed_labels = Vec::new();
        for point in chunk {
            let existing = stored
                .get(&(point.metric.as_str(), point.date))
                .and_then(|values| values.get(&point.labels));
            match existing {
                Some(value) if *value != point.value => {
                    tracing::warn!(
                        labels = ?point.labels,
                        date = %point.date,
                        stored = value,
                        reported = point.value,
                        "Point already stored with a different value; Cloud Monitoring keeps the first write"
                    );
                }
                Some(_) => {}
                None => failed_labels.extend(point.labels.values().cloned()),
            }
        }

        if failed_labels.is_empty() {
            tracing::info!(
                series = chunk.len(),
                "Time series already hold these points; treating chunk as written"
            );
            return Ok(());
        }

        tracing::error!(
            status,
            failed_labels = ?failed_labels,
            "Cloud Monitoring rejected out-of-order time series"
        );
        Err(SinkError::Rejected {
            status,
            message: api_error_message(body),
            failed_labels,
        })
    }

    /// Values stored for `metric` exactly at `end`, via `timeSeries.list`.
    async fn stored_values(&self, metric: &str, end: DateTime<Utc>) -> Result<StoredValues, SinkError> {
        let url = format!("{}/projects/{}/timeSeries", self.base_url, self.project);
        let filter = format!("metric.type = \"{}\"", self.config.metric_type(metric));
        let end_time = Self::format_time(end);
        let start_time = Self::format_time(end - chrono::Duration::seconds(1));

        let mut stored = StoredValues::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("filter", filter.clone()),
                ("interval.startTime", start_time.clone()),
                ("interval.endTime", end_time.clone()),
            ];
            if let Some(page_token) = &page_token {
                params.push(("pageToken", page_token.clone()));
            }

            let token = self.tokens.token().await?;
            let response = with_bearer(self.client.get(&url), &token)
                .timeout(self.timeout)
                .query(&params)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SinkError::Rejected {
                    status: status.as_u16(),
                    message: api_error_message(&body),
                    failed_labels: Vec::new(),
                });
            }

            let page: ListTimeSeriesResponse = response.json().await?;
            for series in page.time_series {
                let at_end = series.points.iter().find(|p| {
                    DateTime::parse_from_rfc3339(&p.interval.end_time).is_ok_and(|t| t == end)
                });
                if let Some(value) = at_end.and_then(|p| p.value.double_value) {
                    stored.insert(series.metric.labels, value);
                }
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(stored)
    }
}

#[async_trait]
impl MetricSink for CloudMonitoringSink {
    #[tracing::instrument(skip(self, points), fields(sink = "cloud_monitoring", points = points.len()))]
    async fn write_batch(&self, points: &[MetricPoint]) -> Result<usize, SinkError> {
        if points.is_empty() {
            return Ok(0);
        }

        if self.config.ensure_descriptor {
            self.ensure_descriptors(points).await;
        }

        let batch_size = self.config.batch_size.clamp(1, MAX_MONITORING_BATCH);
        for (index, chunk) in points.chunks(batch_size).enumerate() {
            self.write_chunk(chunk).await?;
            tracing::debug!(chunk = index, series = chunk.len(), "Wrote time series");
        }

        Ok(points.len())
    }

    fn name(&self) -> &'static str {
        "cloud_monitoring"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest {
    time_series: Vec<TimeSeries>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeries {
    metric: Metric,
    resource: MonitoredResource,
    metric_kind: &'static str,
    value_type: &'static str,
    points: [Point; 1],
}

#[derive(Debug, Serialize)]
struct Metric {
    #[serde(rename = "type")]
    kind: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct MonitoredResource {
    #[serde(rename = "type")]
    kind: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Point {
    interval: TimeInterval,
    value: TypedValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeInterval {
    end_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    double_value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<StoredSeries>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredSeries {
    metric: StoredMetric,
    #[serde(default)]
    points: Vec<StoredPoint>,
}

#[derive(Debug, Deserialize)]
struct StoredMetric {
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StoredPoint {
    interval: StoredInterval,
    value: StoredValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredInterval {
    end_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredValue {
    #[serde(default)]
    double_value: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricDescriptor {
    #[serde(rename = "type")]
    kind: String,
    metric_kind: &'static str,
    value_type: &'static str,
    display_name: String,
    description: String,
    labels: Vec<LabelDescriptor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LabelDescriptor {
    key: String,
    value_type: &'static str,
}
