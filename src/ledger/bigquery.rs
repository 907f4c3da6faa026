//! BigQuery Cloud Billing export ledger.
//!
//! Runs one parameterized query per report through the BigQuery REST API
//! (`jobs.query`), then polls and pages `jobs.getQueryResults` until every
//! row has been read.

use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{CostLedger, LedgerError};
use crate::{
    config::BigQueryLedgerConfig,
    gcp::{TokenProvider, api_error_message, token_provider, with_bearer},
    models::{CostQuery, CostRow},
};

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// How long BigQuery may hold a request open waiting for the job to finish.
const SERVER_WAIT_MS: u64 = 10_000;

pub struct BigQueryLedger {
    project: String,
    table: String,
    location: Option<String>,
    services: Vec<String>,
    positive_costs_only: bool,
    unattributed_project: String,
    base_url: String,
    page_size: u32,
    poll_interval: Duration,
    timeout: Duration,
    tokens: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl BigQueryLedger {
    pub fn from_config(config: &BigQueryLedgerConfig, client: reqwest::Client) -> Self {
        Self {
            project: config.project.clone(),
            table: config.table.clone(),
            location: config.location.clone(),
            services: config.service_filter(),
            positive_costs_only: config.positive_costs_only,
            unattributed_project: config.unattributed_project.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            page_size: config.page_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            tokens: token_provider(&config.credentials),
            client,
        }
    }

    /// Standard SQL for one day of billing rows. Optional filters are only
    /// emitted when configured so that no empty array parameter is sent.
    fn build_sql(&self, query: &CostQuery) -> String {
        let mut sql = format!(
            "SELECT\n  \
               IFNULL(project.id, '') AS project_id,\n  \
               currency,\n  \
               SUM(CAST(cost AS NUMERIC)) AS amount\n\
             FROM `{}`\n\
             WHERE usage_start_time >= @start_time\n  \
               AND usage_start_time < @end_time",
            self.table
        );
        if self.positive_costs_only {
            sql.push_str("\n  AND cost > 0");
        }
        if !self.services.is_empty() {
            sql.push_str("\n  AND service.description IN UNNEST(@services)");
        }
        if query.projects.is_some() {
            sql.push_str("\n  AND project.id IN UNNEST(@projects)");
        }
        sql.push_str("\nGROUP BY project_id, currency\nORDER BY project_id, currency");
        sql
    }

    fn build_parameters(&self, query: &CostQuery) -> Vec<QueryParameter> {
        let mut params = vec![
            QueryParameter::timestamp("start_time", query.start),
            QueryParameter::timestamp("end_time", query.end),
        ];
        if !self.services.is_empty() {
            params.push(QueryParameter::string_array("services", &self.services));
        }
        if let Some(projects) = &query.projects {
            params.push(QueryParameter::string_array("projects", projects));
        }
        params
    }

    async fn start_query(&self, query: &CostQuery) -> Result<QueryResponse, LedgerError> {
        let url = format!("{}/projects/{}/queries", self.base_url, self.project);
        let body = QueryRequest {
            query: self.build_sql(query),
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: self.build_parameters(query),
            max_results: self.page_size,
            timeout_ms: SERVER_WAIT_MS,
            location: self.location.as_deref(),
        };

        let token = self.tokens.token().await?;
        let req = with_bearer(self.client.post(&url), &token)
            .timeout(self.timeout)
            .json(&body);
        send(req).await
    }

    async fn get_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, LedgerError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.base_url, job.project_id, job.job_id
        );
        let mut params: Vec<(&str, String)> = vec![
            ("maxResults", self.page_size.to_string()),
            ("timeoutMs", SERVER_WAIT_MS.to_string()),
        ];
        if let Some(location) = job.location.as_deref().or(self.location.as_deref()) {
            params.push(("location", location.to_string()));
        }
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }

        let token = self.tokens.token().await?;
        let req = with_bearer(self.client.get(&url), &token)
            .timeout(self.timeout)
            .query(&params);
        send(req).await
    }

    fn parse_row(&self, row: &TableRow) -> Result<CostRow, LedgerError> {
        let [project, currency, amount] = row.f.as_slice() else {
            return Err(LedgerError::Malformed(format!(
                "expected 3 columns, got {}",
                row.f.len()
            )));
        };

        let project_id = match project.as_str() {
            None | Some("") => self.unattributed_project.clone(),
            Some(id) => id.to_string(),
        };
        let currency = currency
            .as_str()
            .ok_or_else(|| {
                LedgerError::Malformed(format!("missing currency for project '{project_id}'"))
            })?
            .to_string();
        let amount = amount.as_str().ok_or_else(|| {
            LedgerError::Malformed(format!("missing amount for project '{project_id}'"))
        })?;

        Ok(CostRow::new(project_id, parse_amount(amount)?, currency))
    }
}

#[async_trait]
impl CostLedger for BigQueryLedger {
    #[tracing::instrument(
        skip(self, query),
        fields(ledger = "bigquery", date = %query.date, start = %query.start, end = %query.end)
    )]
    async fn query(&self, query: &CostQuery) -> Result<Vec<CostRow>, LedgerError> {
        let mut page = self.start_query(query).await?;
        page.check_errors()?;
        let job = page
            .job_reference
            .clone()
            .ok_or_else(|| LedgerError::Malformed("response has no jobReference".into()))?;

        let mut rows = Vec::new();
        let mut pages = 0usize;
        loop {
            let next_page = if page.job_complete {
                pages += 1;
                for row in &page.rows {
                    rows.push(self.parse_row(row)?);
                }
                match page.page_token.take() {
                    Some(token) => Some(token),
                    None => break,
                }
            } else {
                tracing::debug!(job_id = %job.job_id, "query job still running");
                tokio::time::sleep(self.poll_interval).await;
                None
            };

            page = self.get_results(&job, next_page.as_deref()).await?;
            page.check_errors()?;
        }

        tracing::debug!(
            job_id = %job.job_id,
            rows = rows.len(),
            pages,
            "billing query complete"
        );
        Ok(rows)
    }

    fn name(&self) -> &'static str {
        "bigquery"
    }
}

async fn send(req: reqwest::RequestBuilder) -> Result<QueryResponse, LedgerError> {
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LedgerError::Status {
            status: status.as_u16(),
            message: api_error_message(&body),
        });
    }
    response
        .json::<QueryResponse>()
        .await
        .map_err(|e| LedgerError::Malformed(e.to_string()))
}

/// NUMERIC columns arrive as decimal strings; FLOAT64 columns may use
/// scientific notation (`1.5E-7`).
fn parse_amount(raw: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| LedgerError::Malformed(format!("invalid amount '{raw}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: String,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter>,
    max_results: u32,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter {
    name: String,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParameterType {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    array_type: Option<Box<ParameterType>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParameterValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    array_values: Vec<ParameterValue>,
}

impl QueryParameter {
    fn timestamp(name: &str, at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType {
                kind: "TIMESTAMP",
                array_type: None,
            },
            parameter_value: ParameterValue {
                value: Some(at.format("%Y-%m-%d %H:%M:%S%.6f+00:00").to_string()),
                array_values: Vec::new(),
            },
        }
    }

    fn string_array<'a>(name: &str, values: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType {
                kind: "ARRAY",
                array_type: Some(Box::new(ParameterType {
                    kind: "STRING",
                    array_type: None,
                })),
            },
            parameter_value: ParameterValue {
                value: None,
                array_values: values
                    .into_iter()
                    .map(|v| ParameterValue {
                        value: Some(v.clone()),
                        array_values: Vec::new(),
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

impl QueryResponse {
    fn check_errors(&self) -> Result<(), LedgerError> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let message = self
            .errors
            .iter()
            .map(|e| match &e.reason {
                Some(reason) => format!("{reason}: {}", e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(LedgerError::Query(message))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Option<serde_json::Value>,
}

impl TableCell {
    fn as_str(&self) -> Option<&str> {
        self.v.as_ref().and_then(|v| v.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: String,
}
