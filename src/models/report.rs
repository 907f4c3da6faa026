use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Serialize;

use super::{CostRow, MetricNaming, MetricPoint};

/// Per-project and total cost for one reporting day.
///
/// Built once by [`DailyCostReport::aggregate`] and never mutated. The sum of
/// `projects` always equals `total` exactly since both use decimal arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCostReport {
    pub date: NaiveDate,
    pub currency: String,
    pub projects: BTreeMap<String, Decimal>,
    pub total: Decimal,
}

/// Semantically invalid ledger data. Retrying will not fix any of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("negative cost {amount} {currency} for project '{project_id}'")]
    NegativeAmount {
        project_id: String,
        amount: Decimal,
        currency: String,
    },

    #[error("cost row with empty project id")]
    EmptyProjectId,

    #[error("mixed currencies: expected {expected}, project '{project_id}' reported {found}")]
    MixedCurrency {
        project_id: String,
        expected: String,
        found: String,
    },

    #[error("project id '{0}' collides with the total label")]
    ReservedProjectId(String),

    #[error("cost for '{project_id}' exceeds the representable decimal range")]
    AmountOverflow { project_id: String },
}

impl DailyCostReport {
    /// Group rows by project and sum them.
    ///
    /// `default_currency` is used when there are no rows at all. `total_label`
    /// is rejected as a project id because its series would overwrite the
    /// grand total.
    pub fn aggregate(
        date: NaiveDate,
        rows: &[CostRow],
        default_currency: &str,
        total_label: &str,
    ) -> Result<Self, ValidationError> {
        let mut projects: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut currency: Option<&str> = None;

        for row in rows {
            if row.project_id.is_empty() {
                return Err(ValidationError::EmptyProjectId);
            }
            if row.project_id == total_label {
                return Err(ValidationError::ReservedProjectId(row.project_id.clone()));
            }
            if row.amount.is_sign_negative() && !row.amount.is_zero() {
                return Err(ValidationError::NegativeAmount {
                    project_id: row.project_id.clone(),
                    amount: row.amount,
                    currency: row.currency.clone(),
                });
            }
            match currency {
                None => currency = Some(&row.currency),
                Some(expected) if !expected.eq_ignore_ascii_case(&row.currency) => {
                    return Err(ValidationError::MixedCurrency {
                        project_id: row.project_id.clone(),
                        expected: expected.to_string(),
                        found: row.currency.clone(),
                    });
                }
                Some(_) => {}
            }

            let sum = projects.entry(row.project_id.clone()).or_default();
            *sum = sum
                .checked_add(row.amount)
                .ok_or_else(|| ValidationError::AmountOverflow {
                    project_id: row.project_id.clone(),
                })?;
        }

        let mut total = Decimal::ZERO;
        for amount in projects.values() {
            total = total
                .checked_add(*amount)
                .ok_or_else(|| ValidationError::AmountOverflow {
                    project_id: total_label.to_string(),
                })?;
        }
        let currency = currency.unwrap_or(default_currency).to_ascii_uppercase();

        Ok(Self {
            date,
            currency,
            projects,
            total,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// One point per project in project-id order, followed by the total.
    pub fn to_metric_points(&self, naming: &MetricNaming) -> Vec<MetricPoint> {
        self.projects
            .iter()
            .map(|(project_id, amount)| (project_id.as_str(), *amount))
            .chain(std::iter::once((naming.total_label.as_str(), self.total)))
            .map(|(label, amount)| {
                MetricPoint::new(
                    naming.metric.clone(),
                    naming.label_key.clone(),
                    label,
                    decimal_to_f64(amount),
                    self.date,
                )
            })
            .collect()
    }
}

fn decimal_to_f64(amount: Decimal) -> f64 {
    // Decimal's range is far inside f64's, so this only fails on exotic scales.
    amount.normalize().to_f64().unwrap_or_default()
}
