//! Thin wrapper around the `croner` 5-field evaluator (minute, hour,
//! day-of-month, month, day-of-week; day-of-week 0 and 7 both mean Sunday;
//! when both day-of-month and day-of-week are restricted, croner applies
//! the common OR semantics, matching spec §9's "Cron expression semantics").

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use croner::{Cron, CronIterator, Direction};

use crate::error::{SchedulerError, SchedulerResult};

pub struct CronSchedule {
    expression: String,
    inner: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let inner = Cron::from_str(expression).map_err(|err| SchedulerError::CronParseError {
            expression: expression.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            expression: expression.to_string(),
            inner,
        })
    }

    /// Next firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        CronIterator::new(self.inner.clone(), after, false, Direction::Forward).next()
    }

    /// Estimated minimum interval between consecutive firings, sampled from
    /// the next handful of occurrences after `from`. Used only to enforce
    /// `min_cron_interval_seconds` (spec §4.3 step 2); it is a sample, not a
    /// proof, since an irregular expression can have a variable gap.
    pub fn min_interval_seconds(&self, from: DateTime<Utc>) -> i64 {
        let samples: Vec<DateTime<Utc>> =
            CronIterator::new(self.inner.clone(), from, false, Direction::Forward)
                .take(12)
                .collect();

        samples
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_seconds())
            .min()
            .unwrap_or(i64::MAX)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

pub fn exceeds_interval_floor(interval_seconds: i64, floor: TimeDelta) -> bool {
    interval_seconds < floor.num_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_malformed_expression() {
        let err = CronSchedule::parse("not a cron").unwrap_err();
        assert!(matches!(err, SchedulerError::CronParseError { .. }));
    }

    #[test]
    fn next_after_is_strictly_after() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let next = schedule.next_after(start).unwrap();

        assert!(next > start);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn min_interval_matches_fixed_step_expression() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(schedule.min_interval_seconds(from), 5 * 60);
    }

    #[test]
    fn interval_floor_rejects_too_frequent_expressions() {
        assert!(exceeds_interval_floor(30, TimeDelta::seconds(60)));
        assert!(!exceeds_interval_floor(60, TimeDelta::seconds(60)));
        assert!(!exceeds_interval_floor(120, TimeDelta::seconds(60)));
    }
}
