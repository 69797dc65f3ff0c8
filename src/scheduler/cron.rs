//! Five-field cron expressions evaluated in UTC.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use std::fmt;

/// How far ahead [`CronSchedule::next_after`] searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

/// `minute hour day-of-month month day-of-week`. Day-of-week runs 0-7 with
/// both 0 and 7 meaning Sunday; when both day fields are restricted a day
/// matches if either does.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            bail!(
                "Cron expression '{}' must have 5 fields, found {}",
                expression,
                fields.len()
            );
        }
        let expression = fields.join(" ");
        let cron = Cron::new(&expression)
            .parse()
            .map_err(|e| anyhow!("Invalid cron expression '{}': {}", expression, e))?;
        Ok(Self { expression, cron })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching minute strictly after `after`, or `None` when nothing
    /// matches within about five years (for example `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.cron.find_next_occurrence(&after, false).ok()?;
        (next <= after + Duration::days(SEARCH_HORIZON_DAYS)).then_some(next)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}
