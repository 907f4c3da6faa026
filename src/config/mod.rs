//! Configuration for the cost reporter.
//!
//! The reporter is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` and `${VAR_NAME:-default}`.
//!
//! # Example
//!
//! ```toml
//! [reporter]
//! timezone = "America/Los_Angeles"
//!
//! [ledger]
//! type = "bigquery"
//! project = "${GCP_PROJECT}"
//! table = "${BILLING_TABLE}"
//! services = ["BigQuery"]
//!
//! [sink]
//! type = "cloud_monitoring"
//! project = "${GCP_PROJECT}"
//! ```

mod gcp;
mod ledger;
mod observability;
mod reporter;
mod server;
mod sink;

use std::path::Path;

pub use gcp::*;
pub use ledger::*;
pub use observability::*;
pub use reporter::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use sink::*;

/// Configuration used when no file is present. Matches the environment a
/// Cloud Run deployment of the reporter is given.
pub const ENV_CONFIG_TEMPLATE: &str = r#"
[server]
port = ${PORT:-8080}

[reporter]
timezone = "${REPORT_TIMEZONE:-UTC}"

[ledger]
type = "bigquery"
project = "${GCP_PROJECT}"
table = "${BILLING_TABLE}"
services = ["${BILLING_SERVICES:-BigQuery}"]
positive_costs_only = ${BILLING_POSITIVE_COSTS_ONLY:-true}

[sink]
type = "cloud_monitoring"
project = "${GCP_PROJECT}"

[observability.logging]
format = "${LOG_FORMAT:-json}"
"#;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostwatchConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Aggregation settings: timezone, naming, filters and timeouts.
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// Billing data source.
    pub ledger: LedgerConfig,

    /// Metric destination.
    pub sink: SinkConfig,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl CostwatchConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Build configuration from environment variables alone.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_str(ENV_CONFIG_TEMPLATE)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: CostwatchConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate().map_err(ConfigError::Validation)?;
        self.reporter.validate().map_err(ConfigError::Validation)?;
        self.ledger.validate().map_err(ConfigError::Validation)?;
        self.sink.validate().map_err(ConfigError::Validation)?;

        let LedgerConfig::Bigquery(ledger) = &self.ledger;
        if ledger.unattributed_project == self.reporter.total_label {
            return Err(ConfigError::Validation(format!(
                "ledger.unattributed_project '{}' collides with reporter.total_label",
                ledger.unattributed_project
            )));
        }

        if matches!(self.sink, SinkConfig::Log) {
            tracing::warn!("sink.type = \"log\": cost points will only be logged, not stored");
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}` or
/// `${VAR_NAME:-default}`. The default applies when the variable is unset or
/// empty. Skips commented lines (lines where content before the variable is
/// a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = match (std::env::var(var_name), cap.get(2)) {
                (Ok(value), Some(default)) if value.is_empty() => default.as_str().to_string(),
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
            };
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
