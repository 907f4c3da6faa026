//! Scheduler-facing trigger endpoint.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Query, State},
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::{AppState, reporter::RunSummary};

#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    /// Report this day (`YYYY-MM-DD`) instead of yesterday.
    pub date: Option<String>,
}

/// Body returned after a successful run.
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    pub date: NaiveDate,
    pub currency: String,
    pub projects: BTreeMap<String, Decimal>,
    pub total: Decimal,
    pub points_written: usize,
}

impl From<RunSummary> for TriggerResponse {
    fn from(summary: RunSummary) -> Self {
        Self {
            status: "ok".to_string(),
            date: summary.report.date,
            currency: summary.report.currency,
            projects: summary.report.projects,
            total: summary.report.total,
            points_written: summary.points_written,
        }
    }
}

/// Run the daily report. Accepts any method; the body is ignored.
#[tracing::instrument(name = "report.trigger", skip(state, params), fields(date = ?params.date))]
pub async fn trigger(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let as_of = params
        .date
        .as_deref()
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
                ApiError::bad_request("invalid_date", format!("invalid date '{raw}': {e}"))
            })
        })
        .transpose()?;

    let summary = state
        .reporter
        .run_within(as_of, state.request_timeout)
        .await?;
    Ok(Json(summary.into()))
}
