//! Daily cost reporter.
//!
//! One run turns a day of billing rows into one metric point per project
//! plus a grand-total point:
//!
//! 1. Resolve the date (explicit, or yesterday in the reporting timezone)
//! 2. Query the ledger for that day, bounded by the query timeout
//! 3. Group and validate the rows
//! 4. Write all points to the sink, bounded by the write timeout
//!
//! Nothing is written unless the whole report validated. Reruns for the same
//! date produce identical points, so retrying a failed run is always safe.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::{
    config::ReporterConfig,
    ledger::{CostLedger, LedgerError},
    models::{CostQuery, DailyCostReport, MetricNaming, ValidationError},
    observability::metrics,
    sink::{MetricSink, SinkError},
};

/// Runtime settings for a [`CostReporter`], resolved from [`ReporterConfig`].
#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub timezone: Tz,
    pub naming: MetricNaming,
    pub default_currency: String,
    pub projects: Option<std::collections::BTreeSet<String>>,
    pub query_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            naming: MetricNaming::default(),
            default_currency: "USD".to_string(),
            projects: None,
            query_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(60),
        }
    }
}

impl TryFrom<&ReporterConfig> for ReporterSettings {
    type Error = String;

    fn try_from(config: &ReporterConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            timezone: config.tz()?,
            naming: config.naming(),
            default_currency: config.default_currency.to_ascii_uppercase(),
            projects: (!config.projects.is_empty()).then(|| config.projects.clone()),
            query_timeout: config.query_timeout(),
            write_timeout: config.write_timeout(),
        })
    }
}

/// Why a run failed. Each variant maps to one outcome kind.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("ledger query failed: {0}")]
    Query(#[source] LedgerError),

    #[error("billing data failed validation: {0}")]
    Validation(#[source] ValidationError),

    #[error("metric write failed: {0}")]
    Write(#[source] SinkError),

    #[error("report did not finish within {0:?}")]
    Deadline(Duration),
}

impl ReportError {
    /// Stable outcome label for logs, metrics and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ReportError::Query(_) => "query_error",
            ReportError::Validation(_) => "validation_error",
            ReportError::Write(_) => "write_error",
            ReportError::Deadline(_) => "timeout_error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ReportError::Query(e) => e.is_timeout(),
            ReportError::Write(e) => e.is_timeout(),
            ReportError::Validation(_) => false,
            ReportError::Deadline(_) => true,
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub report: DailyCostReport,
    pub points_written: usize,
}

pub struct CostReporter {
    ledger: Arc<dyn CostLedger>,
    sink: Arc<dyn MetricSink>,
    settings: ReporterSettings,
}

impl CostReporter {
    pub fn new(
        ledger: Arc<dyn CostLedger>,
        sink: Arc<dyn MetricSink>,
        settings: ReporterSettings,
    ) -> Self {
        Self {
            ledger,
            sink,
            settings,
        }
    }

    pub fn settings(&self) -> &ReporterSettings {
        &self.settings
    }

    /// Report `as_of`, or yesterday in the reporting timezone when `None`.
    pub async fn run(&self, as_of: Option<NaiveDate>) -> Result<RunSummary, ReportError> {
        self.run_at(Utc::now(), as_of).await
    }

    /// [`run`](Self::run) bounded by `deadline` as a whole.
    ///
    /// An expired deadline is recorded as a `timeout_error` outcome. Points
    /// may already have been written when it fires; rerunning is safe.
    pub async fn run_within(
        &self,
        as_of: Option<NaiveDate>,
        deadline: Duration,
    ) -> Result<RunSummary, ReportError> {
        self.observe(Utc::now(), as_of, Some(deadline)).await
    }

    /// [`run`](Self::run) with an explicit notion of "now".
    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        as_of: Option<NaiveDate>,
    ) -> Result<RunSummary, ReportError> {
        self.observe(now, as_of, None).await
    }

    async fn observe(
        &self,
        now: DateTime<Utc>,
        as_of: Option<NaiveDate>,
        deadline: Option<Duration>,
    ) -> Result<RunSummary, ReportError> {
        let started = std::time::Instant::now();
        let date = as_of.unwrap_or_else(|| self.yesterday(now));

        let result = match deadline {
            Some(limit) => tokio::time::timeout(limit, self.run_for(date))
                .await
                .unwrap_or_else(|_| Err(ReportError::Deadline(limit))),
            None => self.run_for(date).await,
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(summary) => {
                metrics::record_report_run("success", elapsed.as_secs_f64());
                tracing::info!(
                    date = %date,
                    currency = %summary.report.currency,
                    projects = summary.report.projects.len(),
                    total = %summary.report.total,
                    points_written = summary.points_written,
                    duration_ms = elapsed.as_millis() as u64,
                    "Daily cost report written"
                );
            }
            Err(e @ ReportError::Validation(_)) => {
                metrics::record_report_run(e.kind(), elapsed.as_secs_f64());
                tracing::error!(
                    date = %date,
                    error = %e,
                    error_kind = e.kind(),
                    data_quality = true,
                    "Billing data rejected; nothing was written"
                );
            }
            Err(e) => {
                metrics::record_report_run(e.kind(), elapsed.as_secs_f64());
                tracing::error!(
                    date = %date,
                    error = %e,
                    error_kind = e.kind(),
                    timeout = e.is_timeout(),
                    "Daily cost report failed"
                );
            }
        }

        result
    }

    /// Calendar day before `now`, in the reporting timezone.
    pub fn yesterday(&self, now: DateTime<Utc>) -> NaiveDate {
        let today = now.with_timezone(&self.settings.timezone).date_naive();
        today.checked_sub_days(Days::new(1)).unwrap_or(today)
    }

    async fn run_for(&self, date: NaiveDate) -> Result<RunSummary, ReportError> {
        let query = CostQuery::for_day(date, self.settings.timezone, self.settings.projects.clone());

        let rows = tokio::time::timeout(self.settings.query_timeout, self.ledger.query(&query))
            .await
            .map_err(|_| LedgerError::Timeout(self.settings.query_timeout))
            .and_then(|r| r)
            .map_err(ReportError::Query)?;
        metrics::record_ledger_rows(self.ledger.name(), rows.len());

        let in_scope: Vec<_> = rows.into_iter().filter(|r| query.includes(&r.project_id)).collect();
        let report = DailyCostReport::aggregate(
            date,
            &in_scope,
            &self.settings.default_currency,
            &self.settings.naming.total_label,
        )
        .map_err(ReportError::Validation)?;

        if report.is_empty() {
            tracing::info!(date = %date, "No billing rows for day; reporting a zero total");
        }

        let points = report.to_metric_points(&self.settings.naming);
        let points_written =
            tokio::time::timeout(self.settings.write_timeout, self.sink.write_batch(&points))
                .await
                .map_err(|_| SinkError::Timeout(self.settings.write_timeout))
                .and_then(|r| r)
                .map_err(ReportError::Write)?;
        metrics::record_points_written(self.sink.name(), points_written);

        Ok(RunSummary {
            report,
            points_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::dec;

    use super::*;
    use crate::{
        models::CostRow,
        test_utils::{FailingSink, FakeLedger, InMemorySink, LogCapture, SlowLedger, SlowSink},
    };

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn rows() -> Vec<CostRow> {
        vec![
            CostRow::new("proj-a", dec!(10.00), "USD"),
            CostRow::new("proj-b", dec!(7.25), "USD"),
            CostRow::new("proj-a", dec!(3.50), "USD"),
        ]
    }

    fn reporter(
        ledger: Arc<dyn CostLedger>,
        sink: Arc<dyn MetricSink>,
    ) -> CostReporter {
        CostReporter::new(ledger, sink, ReporterSettings::default())
    }

    #[tokio::test]
    async fn test_writes_project_and_total_points() {
        let sink = Arc::new(InMemorySink::default());
        let reporter = reporter(Arc::new(FakeLedger::new(rows())), sink.clone());

        let summary = reporter.run(Some(date())).await.unwrap();

        assert_eq!(summary.points_written, 3);
        assert_eq!(summary.report.total, dec!(20.75));
        assert_eq!(sink.value("proj-a", date()), Some(13.5));
        assert_eq!(sink.value("proj-b", date()), Some(7.25));
        assert_eq!(sink.value("total", date()), Some(20.75));
    }

    #[tokio::test]
    async fn test_same_rows_in_any_order_write_identical_points() {
        let forward = Arc::new(InMemorySink::default());
        let mut reversed_rows = rows();
        reversed_rows.reverse();
        let backward = Arc::new(InMemorySink::default());

        reporter(Arc::new(FakeLedger::new(rows())), forward.clone())
            .run(Some(date()))
            .await
            .unwrap();
        reporter(Arc::new(FakeLedger::new(reversed_rows)), backward.clone())
            .run(Some(date()))
            .await
            .unwrap();

        assert_eq!(forward.batches(), backward.batches());
    }

    #[tokio::test]
    async fn test_rerun_overwrites_instead_of_accumulating() {
        let sink = Arc::new(InMemorySink::default());
        let reporter = reporter(Arc::new(FakeLedger::new(rows())), sink.clone());

        reporter.run(Some(date())).await.unwrap();
        let after_first = sink.snapshot();
        reporter.run(Some(date())).await.unwrap();

        assert_eq!(sink.snapshot(), after_first);
        assert_eq!(sink.value("total", date()), Some(20.75));
    }

    #[tokio::test]
    async fn test_negative_amount_writes_nothing() {
        let sink = Arc::new(InMemorySink::default());
        let mut rows = rows();
        rows.push(CostRow::new("proj-c", dec!(-1.00), "USD"));
        let reporter = reporter(Arc::new(FakeLedger::new(rows)), sink.clone());

        let err = reporter.run(Some(date())).await.unwrap_err();

        assert_eq!(err.kind(), "validation_error");
        assert!(matches!(
            err,
            ReportError::Validation(ValidationError::NegativeAmount { .. })
        ));
        assert_eq!(sink.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_rows_writes_zero_total() {
        let sink = Arc::new(InMemorySink::default());
        let reporter = reporter(Arc::new(FakeLedger::new(Vec::new())), sink.clone());

        let summary = reporter.run(Some(date())).await.unwrap();

        assert!(summary.report.is_empty());
        assert_eq!(summary.report.currency, "USD");
        assert_eq!(summary.points_written, 1);
        assert_eq!(sink.value("total", date()), Some(0.0));
    }

    #[tokio::test]
    async fn test_ledger_error_is_query_error() {
        let sink = Arc::new(InMemorySink::default());
        let ledger = FakeLedger::failing(|| LedgerError::Query("table not found".into()));
        let reporter = reporter(Arc::new(ledger), sink.clone());

        let err = reporter.run(Some(date())).await.unwrap_err();

        assert_eq!(err.kind(), "query_error");
        assert!(!err.is_timeout());
        assert_eq!(sink.write_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ledger_times_out() {
        let sink = Arc::new(InMemorySink::default());
        let reporter = CostReporter::new(
            Arc::new(SlowLedger::new(Duration::from_secs(600))),
            sink.clone(),
            ReporterSettings {
                query_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );

        let err = reporter.run(Some(date())).await.unwrap_err();

        assert!(matches!(err, ReportError::Query(LedgerError::Timeout(_))));
        assert!(err.is_timeout());
        assert_eq!(sink.write_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_recorded_as_timeout_outcome() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let sink = Arc::new(InMemorySink::default());
        let reporter = reporter(Arc::new(SlowLedger::new(Duration::from_secs(3600))), sink.clone());

        let err = reporter
            .run_within(Some(date()), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, ReportError::Deadline(d) if d == Duration::from_secs(5)));
        assert_eq!(err.kind(), "timeout_error");
        assert!(err.is_timeout());
        assert_eq!(sink.write_calls(), 0);

        let output = logs.contents();
        assert!(output.contains("Daily cost report failed"), "{output}");
        assert!(output.contains("timeout_error"), "{output}");
    }

    #[tokio::test]
    async fn test_run_within_deadline_succeeds() {
        let sink = Arc::new(InMemorySink::default());
        let reporter = reporter(Arc::new(FakeLedger::new(rows())), sink.clone());

        let summary = reporter
            .run_within(Some(date()), Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(summary.points_written, 3);
        assert_eq!(sink.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_sink_rejection_is_write_error() {
        let reporter = reporter(Arc::new(FakeLedger::new(rows())), Arc::new(FailingSink));

        let err = reporter.run(Some(date())).await.unwrap_err();

        assert_eq!(err.kind(), "write_error");
        assert!(matches!(err, ReportError::Write(SinkError::Rejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_times_out() {
        let reporter = CostReporter::new(
            Arc::new(FakeLedger::new(rows())),
            Arc::new(SlowSink::new(Duration::from_secs(600))),
            ReporterSettings {
                write_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );

        let err = reporter.run(Some(date())).await.unwrap_err();

        assert!(matches!(err, ReportError::Write(SinkError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_defaults_to_yesterday_in_timezone() {
        let ledger = Arc::new(FakeLedger::new(Vec::new()));
        let reporter = CostReporter::new(
            ledger.clone(),
            Arc::new(InMemorySink::default()),
            ReporterSettings {
                timezone: chrono_tz::America::Los_Angeles,
                ..Default::default()
            },
        );
        // 2024-05-02 03:00 UTC is still 2024-05-01 in Los Angeles.
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap();

        let summary = reporter.run_at(now, None).await.unwrap();

        let expected = NaiveDate::from_ymd_opt(2024, 4, 30).unwrap();
        assert_eq!(summary.report.date, expected);
        let query = ledger.last_query().unwrap();
        assert_eq!(query.start, Utc.with_ymd_and_hms(2024, 4, 30, 7, 0, 0).unwrap());
        assert_eq!(query.end, Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_project_filter_passed_to_ledger_and_applied() {
        let ledger = Arc::new(FakeLedger::new(rows()));
        let sink = Arc::new(InMemorySink::default());
        let reporter = CostReporter::new(
            ledger.clone(),
            sink.clone(),
            ReporterSettings {
                projects: Some(["proj-a".to_string()].into()),
                ..Default::default()
            },
        );

        let summary = reporter.run(Some(date())).await.unwrap();

        assert_eq!(summary.report.total, dec!(13.50));
        assert_eq!(sink.value("proj-b", date()), None);
        assert!(ledger.last_query().unwrap().includes("proj-a"));
        assert!(!ledger.last_query().unwrap().includes("proj-b"));
    }

    #[test]
    fn test_settings_from_config() {
        let config = ReporterConfig {
            timezone: "Europe/Berlin".into(),
            default_currency: "eur".into(),
            ..Default::default()
        };
        let settings = ReporterSettings::try_from(&config).unwrap();
        assert_eq!(settings.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(settings.default_currency, "EUR");
        assert!(settings.projects.is_none());
    }
}
