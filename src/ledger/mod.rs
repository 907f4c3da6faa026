//! Billing ledger abstraction.
//!
//! A ledger answers one question: what did each project spend in a given
//! time window? Amounts come back already grouped per project and currency.
//!
//! ## Available Ledgers
//!
//! - **BigQueryLedger**: Cloud Billing export table in BigQuery

mod bigquery;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
pub use bigquery::BigQueryLedger;

use crate::{
    config::LedgerConfig,
    gcp::AuthError,
    models::{CostQuery, CostRow},
};

/// Trait for billing data sources.
#[async_trait]
pub trait CostLedger: Send + Sync {
    /// Return cost rows whose usage falls in `[query.start, query.end)`,
    /// restricted to `query.projects` when present.
    async fn query(&self, query: &CostQuery) -> Result<Vec<CostRow>, LedgerError>;

    /// Get the ledger name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Errors from ledgers.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ledger returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("malformed ledger response: {0}")]
    Malformed(String),

    #[error("query did not complete within {0:?}")]
    Timeout(Duration),
}

impl LedgerError {
    pub fn is_timeout(&self) -> bool {
        match self {
            LedgerError::Timeout(_) => true,
            LedgerError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Build the configured ledger.
pub fn from_config(
    config: &LedgerConfig,
    http_client: reqwest::Client,
) -> Arc<dyn CostLedger> {
    match config {
        LedgerConfig::Bigquery(config) => {
            Arc::new(BigQueryLedger::from_config(config, http_client))
        }
    }
}
