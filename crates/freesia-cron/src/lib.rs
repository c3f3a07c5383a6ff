//! Cron expression handling.
//!
//! One home for parsing schedule expressions so that declaration-time
//! validation and the scheduler's next-fire computation cannot drift apart.
//! Expressions use the seconds-first 6/7-field form; classic 5-field
//! expressions are accepted and normalized by prepending a `0` seconds field.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Error type for cron expression handling.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
  /// The expression could not be parsed.
  #[error("invalid cron expression '{expr}': {message}")]
  Invalid { expr: String, message: String },
}

/// Normalize an expression to the seconds-first form.
///
/// A 5-field expression gets a `0` seconds field prepended; anything else is
/// returned trimmed but otherwise untouched.
pub fn normalize(expr: &str) -> String {
  let trimmed = expr.trim();
  let fields = trimmed.split_whitespace().count();
  if fields == 5 {
    format!("0 {}", trimmed)
  } else {
    trimmed.to_string()
  }
}

/// Check that an expression parses.
pub fn validate(expr: &str) -> Result<(), CronError> {
  parse(expr).map(|_| ())
}

/// Compute the first fire time strictly after `after`.
///
/// Returns `None` for expressions with no future occurrences.
pub fn next_fire(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
  let schedule = parse(expr)?;
  Ok(schedule.after(&after).next())
}

fn parse(expr: &str) -> Result<Schedule, CronError> {
  let normalized = normalize(expr);
  Schedule::from_str(&normalized).map_err(|e| CronError::Invalid {
    expr: expr.to_string(),
    message: e.to_string(),
  })
}
