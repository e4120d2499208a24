// src/dag/schedule.rs

//! Cron schedule wrapper.
//!
//! DAG files use standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week). The `cron` crate wants 6 fields with
//! seconds, so 5-field expressions are normalised by prepending "0 ".

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::errors::{CrondagError, Result};

/// A parsed cron expression together with its source text.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    raw: String,
    parsed: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize_cron_expr(expr);
        let parsed = Schedule::from_str(&normalized).map_err(|e| CrondagError::CronParse {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: expr.to_string(),
            parsed,
        })
    }

    /// The expression as written in the DAG file.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The next firing time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.parsed.after(&now).next()
    }

    /// The start of the scheduling window that ends at `next`.
    ///
    /// Derived by measuring the distance from `next` to the firing after it
    /// and subtracting that same distance from `next`.
    pub fn prev_before(&self, next: DateTime<Utc>) -> DateTime<Utc> {
        let after_next = self
            .parsed
            .after(&(next + Duration::seconds(1)))
            .next()
            .unwrap_or(next);
        let distance = after_next - next;
        next - distance
    }
}

/// Convert a 5-field Unix cron expression to the 6-field form the `cron`
/// crate expects, by running at second 0 of each match. Expressions that
/// already have 6+ fields pass through unchanged.
fn normalize_cron_expr(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalizes_five_field_expressions() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("30 4 * * *"), "0 30 4 * * *");
        assert_eq!(normalize_cron_expr("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn rejects_garbage() {
        assert!(CronSchedule::parse("not a cron line").is_err());
        assert!(CronSchedule::parse("").is_err());
    }

    #[test]
    fn next_after_advances() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap();
        let next = s.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn prev_window_is_one_interval_wide() {
        let s = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let prev = s.prev_before(next);
        assert_eq!(prev, Utc.with_ymd_and_hms(2024, 3, 1, 12, 15, 0).unwrap());
    }
}
