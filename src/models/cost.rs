use std::collections::BTreeSet;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A request for aggregated cost over the half-open interval `[start, end)`.
///
/// The bounds are UTC instants derived from a calendar day in the reporting
/// timezone, so a query built for the same day and zone is always identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostQuery {
    /// Calendar day being reported, in the reporting timezone.
    pub date: NaiveDate,
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
    /// Restrict the query to these projects. `None` means every project.
    pub projects: Option<BTreeSet<String>>,
}

impl CostQuery {
    /// Build the query covering local midnight of `date` up to local midnight
    /// of the following day in `tz`.
    pub fn for_day(date: NaiveDate, tz: Tz, projects: Option<BTreeSet<String>>) -> Self {
        let next = date.succ_opt().unwrap_or(NaiveDate::MAX);
        Self {
            date,
            start: local_midnight(date, tz),
            end: local_midnight(next, tz),
            projects: projects.filter(|p| !p.is_empty()),
        }
    }

    /// Whether a project falls inside the query's project scope.
    pub fn includes(&self, project_id: &str) -> bool {
        self.projects
            .as_ref()
            .is_none_or(|projects| projects.contains(project_id))
    }
}

/// Resolve local midnight to an instant.
///
/// Ambiguous midnights (clock set back) take the earlier instant. Nonexistent
/// midnights (clock jumps forward over 00:00) take the first valid local time
/// after the gap.
fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    let mut candidate = midnight;
    // DST gaps are at most a couple of hours; step forward in 15 minute slices.
    for _ in 0..16 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                return dt.with_timezone(&Utc);
            }
            LocalResult::None => candidate += Duration::minutes(15),
        }
    }
    Utc.from_utc_datetime(&midnight)
}

/// One row returned by the ledger: the cost attributed to a project.
///
/// Several rows may share a project id (for example one per billed service);
/// the reporter sums them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRow {
    pub project_id: String,
    pub amount: Decimal,
    /// ISO 4217 currency code.
    pub currency: String,
}

impl CostRow {
    pub fn new(project_id: impl Into<String>, amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            amount,
            currency: currency.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_for_day_utc_covers_one_day() {
        let query = CostQuery::for_day(date(2024, 1, 15), chrono_tz::UTC, None);
        assert_eq!(query.start.to_rfc3339(), "2024-01-15T00:00:00+00:00");
        assert_eq!(query.end.to_rfc3339(), "2024-01-16T00:00:00+00:00");
        assert!(query.projects.is_none());
    }

    #[test]
    fn test_for_day_offset_timezone() {
        let query = CostQuery::for_day(date(2024, 1, 15), chrono_tz::America::Los_Angeles, None);
        assert_eq!(query.start.to_rfc3339(), "2024-01-15T08:00:00+00:00");
        assert_eq!(query.end.to_rfc3339(), "2024-01-16T08:00:00+00:00");
    }

    #[test]
    fn test_for_day_dst_transition_is_23_hours() {
        // US spring-forward happens at 02:00 local on 2024-03-10.
        let query = CostQuery::for_day(date(2024, 3, 10), chrono_tz::America::New_York, None);
        assert_eq!(query.end - query.start, Duration::hours(23));
    }

    #[test]
    fn test_for_day_nonexistent_midnight() {
        // Havana skips 00:00-01:00 when DST starts.
        let query = CostQuery::for_day(date(2023, 3, 12), chrono_tz::America::Havana, None);
        assert_eq!(query.start.to_rfc3339(), "2023-03-12T05:00:00+00:00");
    }

    #[test]
    fn test_empty_project_filter_means_all() {
        let query = CostQuery::for_day(date(2024, 1, 15), chrono_tz::UTC, Some(BTreeSet::new()));
        assert!(query.projects.is_none());
        assert!(query.includes("anything"));
    }

    #[test]
    fn test_project_filter() {
        let projects = BTreeSet::from(["alpha".to_string()]);
        let query = CostQuery::for_day(date(2024, 1, 15), chrono_tz::UTC, Some(projects));
        assert!(query.includes("alpha"));
        assert!(!query.includes("beta"));
    }
}
