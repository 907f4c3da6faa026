//! Daily cloud cost reporter.
//!
//! Reads a day of billing rows from a [`ledger::CostLedger`], totals them per
//! project and writes one gauge point per project plus a grand total to a
//! [`sink::MetricSink`]. Runs are triggered over HTTP (`/`) or from the CLI.

pub mod config;
pub mod gcp;
pub mod ledger;
mod middleware;
pub mod models;
pub mod observability;
pub mod reporter;
pub mod routes;
pub mod sink;

#[cfg(test)]
mod test_utils;

use std::{sync::Arc, time::Duration};

use crate::{
    config::CostwatchConfig,
    reporter::{CostReporter, ReporterSettings},
    sink::{LogSink, MetricSink},
};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub reporter: Arc<CostReporter>,
    /// Upper bound on a whole triggered run.
    pub request_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid reporter settings: {0}")]
    Settings(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl AppState {
    /// Wire up the ledger, sink and reporter described by `config`.
    ///
    /// With `dry_run` the configured sink is replaced by [`LogSink`], so a run
    /// queries and validates real data without publishing anything.
    pub fn from_config(config: &CostwatchConfig, dry_run: bool) -> Result<Self, StartupError> {
        let settings =
            ReporterSettings::try_from(&config.reporter).map_err(StartupError::Settings)?;

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("costwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let ledger = ledger::from_config(&config.ledger, http_client.clone());
        let sink: Arc<dyn MetricSink> = if dry_run {
            Arc::new(LogSink)
        } else {
            sink::from_config(&config.sink, settings.timezone, http_client)
        };

        tracing::info!(
            ledger = ledger.name(),
            sink = sink.name(),
            timezone = %settings.timezone,
            dry_run,
            "Reporter configured"
        );

        Ok(Self {
            reporter: Arc::new(CostReporter::new(ledger, sink, settings)),
            request_timeout: Duration::from_secs(config.server.timeout_secs),
        })
    }
}
