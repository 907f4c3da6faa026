use async_trait::async_trait;

use super::{MetricSink, SinkError};
use crate::models::MetricPoint;

/// Sink that emits each point as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl MetricSink for LogSink {
    async fn write_batch(&self, points: &[MetricPoint]) -> Result<usize, SinkError> {
        for point in points {
            tracing::info!(
                metric = %point.metric,
                labels = ?point.labels,
                value = point.value,
                date = %point.date,
                "metric point"
            );
        }
        Ok(points.len())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
