//! In-memory ledgers and sinks for tests.

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing_subscriber::fmt::MakeWriter;

use crate::{
    ledger::{CostLedger, LedgerError},
    models::{CostQuery, CostRow, MetricPoint, SeriesKey},
    sink::{MetricSink, SinkError},
};

/// Ledger returning fixed rows (or a fixed error) and remembering the last query.
pub struct FakeLedger {
    rows: Vec<CostRow>,
    error: Option<fn() -> LedgerError>,
    last_query: Mutex<Option<CostQuery>>,
}

impl FakeLedger {
    pub fn new(rows: Vec<CostRow>) -> Self {
        Self {
            rows,
            error: None,
            last_query: Mutex::new(None),
        }
    }

    pub fn failing(error: fn() -> LedgerError) -> Self {
        Self {
            rows: Vec::new(),
            error: Some(error),
            last_query: Mutex::new(None),
        }
    }

    pub fn last_query(&self) -> Option<CostQuery> {
        self.last_query.lock().unwrap().clone()
    }
}

#[async_trait]
impl CostLedger for FakeLedger {
    async fn query(&self, query: &CostQuery) -> Result<Vec<CostRow>, LedgerError> {
        *self.last_query.lock().unwrap() = Some(query.clone());
        match self.error {
            Some(make_error) => Err(make_error()),
            None => Ok(self.rows.clone()),
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Ledger that never answers before `delay`.
pub struct SlowLedger {
    delay: Duration,
}

impl SlowLedger {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl CostLedger for SlowLedger {
    async fn query(&self, _query: &CostQuery) -> Result<Vec<CostRow>, LedgerError> {
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

/// Sink with overwrite semantics: a point replaces any earlier point with the
/// same metric, labels and date.
#[derive(Default)]
pub struct InMemorySink {
    series: Mutex<BTreeMap<SeriesKey, f64>>,
    batches: Mutex<Vec<Vec<MetricPoint>>>,
}

impl InMemorySink {
    /// Stored `daily_cost` value for `project=<label>` on `date`.
    pub fn value(&self, label: &str, date: NaiveDate) -> Option<f64> {
        let key = SeriesKey {
            metric: "daily_cost".to_string(),
            labels: vec![("project".to_string(), label.to_string())],
            date,
        };
        self.series.lock().unwrap().get(&key).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<SeriesKey, f64> {
        self.series.lock().unwrap().clone()
    }

    /// Every batch received, in arrival order.
    pub fn batches(&self) -> Vec<Vec<MetricPoint>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl MetricSink for InMemorySink {
    async fn write_batch(&self, points: &[MetricPoint]) -> Result<usize, SinkError> {
        self.batches.lock().unwrap().push(points.to_vec());
        let mut series = self.series.lock().unwrap();
        for point in points {
            series.insert(point.key(), point.value);
        }
        Ok(points.len())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Sink that rejects every write.
pub struct FailingSink;

#[async_trait]
impl MetricSink for FailingSink {
    async fn write_batch(&self, points: &[MetricPoint]) -> Result<usize, SinkError> {
        Err(SinkError::Rejected {
            status: 503,
            message: "unavailable".into(),
            failed_labels: points
                .iter()
                .flat_map(|p| p.labels.values().cloned())
                .collect(),
        })
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Sink that accepts writes only after `delay`.
pub struct SlowSink {
    delay: Duration,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl MetricSink for SlowSink {
    async fn write_batch(&self, points: &[MetricPoint]) -> Result<usize, SinkError> {
        tokio::time::sleep(self.delay).await;
        Ok(points.len())
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

/// Collects formatted log output from the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route this thread's events here until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
