use serde::{Deserialize, Serialize};

use super::GcpCredentials;

/// Where billing rows come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerConfig {
    /// BigQuery Cloud Billing export table.
    Bigquery(BigQueryLedgerConfig),
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            LedgerConfig::Bigquery(config) => config.validate(),
        }
    }
}

/// BigQuery billing export configuration.
///
/// ```toml
/// [ledger]
/// type = "bigquery"
/// project = "my-billing-project"
/// table = "my-billing-project.billing.gcp_billing_export_v1_*"
/// services = ["BigQuery"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BigQueryLedgerConfig {
    /// Project the query job runs (and is billed) in.
    pub project: String,

    /// Fully qualified billing export table. Wildcard tables are allowed.
    pub table: String,

    /// Dataset location (e.g. "US", "EU"). Needed to poll jobs outside the US.
    #[serde(default)]
    pub location: Option<String>,

    /// Only count these billed services (`service.description`). Entries may
    /// hold comma-separated names. An empty list or `"*"` counts every service.
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    /// Skip rows with a zero or negative cost.
    #[serde(default = "default_positive_costs_only")]
    pub positive_costs_only: bool,

    /// Project name used for rows without a project (billing-account level charges).
    #[serde(default = "default_unattributed_project")]
    pub unattributed_project: String,

    /// Credentials used to call the BigQuery API.
    #[serde(default)]
    pub credentials: GcpCredentials,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum rows fetched per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Interval between polls while a query job is still running, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// API base URL override (tests, emulators).
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_services() -> Vec<String> {
    vec!["BigQuery".to_string()]
}

fn default_positive_costs_only() -> bool {
    true
}

fn default_unattributed_project() -> String {
    "unattributed".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_page_size() -> u32 {
    10_000
}

fn default_poll_interval() -> u64 {
    1_000
}

/// Billing export tables are referenced inside backticks, so only characters
/// valid in BigQuery identifiers are accepted.
fn is_valid_table_reference(table: &str) -> bool {
    !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '*' | ':'))
}

impl BigQueryLedgerConfig {
    /// Service names to filter on. Empty means no service filter.
    pub fn service_filter(&self) -> Vec<String> {
        let names: Vec<String> = self
            .services
            .iter()
            .flat_map(|entry| entry.split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if names.iter().any(|name| name == "*") {
            return Vec::new();
        }
        names
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.project.trim().is_empty() {
            return Err("ledger.project must not be empty".into());
        }
        if !is_valid_table_reference(&self.table) {
            return Err(format!(
                "ledger.table '{}' is not a valid table reference (project.dataset.table)",
                self.table
            ));
        }
        if self.unattributed_project.trim().is_empty() {
            return Err("ledger.unattributed_project must not be empty".into());
        }
        if self.timeout_secs == 0 {
            return Err("ledger.timeout_secs must be greater than 0".into());
        }
        if self.page_size == 0 {
            return Err("ledger.page_size must be greater than 0".into());
        }
        self.credentials.validate("ledger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> LedgerConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_parse_bigquery() {
        let LedgerConfig::Bigquery(config) = parse(
            r#"
            type = "bigquery"
            project = "billing-proj"
            table = "billing-proj.billing.gcp_billing_export_v1_*"
            services = ["BigQuery"]
        "#,
        );
        assert_eq!(config.project, "billing-proj");
        assert_eq!(config.services, vec!["BigQuery".to_string()]);
        assert_eq!(config.unattributed_project, "unattributed");
        assert_eq!(config.page_size, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_count_positive_bigquery_spend() {
        let LedgerConfig::Bigquery(config) = parse(
            r#"
            type = "bigquery"
            project = "p"
            table = "p.d.t"
        "#,
        );
        assert_eq!(config.service_filter(), vec!["BigQuery".to_string()]);
        assert!(config.positive_costs_only);
    }

    #[test]
    fn test_service_filter_splits_and_wildcards() {
        let LedgerConfig::Bigquery(mut config) = parse(
            r#"
            type = "bigquery"
            project = "p"
            table = "p.d.t"
            services = ["BigQuery, Cloud Storage", ""]
        "#,
        );
        assert_eq!(
            config.service_filter(),
            vec!["BigQuery".to_string(), "Cloud Storage".to_string()]
        );

        config.services = vec!["*".to_string()];
        assert!(config.service_filter().is_empty());
        config.services.clear();
        assert!(config.service_filter().is_empty());
    }

    #[test]
    fn test_table_with_backtick_rejected() {
        let LedgerConfig::Bigquery(config) = parse(
            r#"
            type = "bigquery"
            project = "p"
            table = "p.d.t` WHERE 1=1 --"
        "#,
        );
        assert!(config.validate().unwrap_err().contains("table"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<LedgerConfig, _> = toml::from_str(
            r#"
            type = "bigquery"
            project = "p"
            table = "p.d.t"
            dataset = "nope"
        "#,
        );
        assert!(result.is_err());
    }
}
