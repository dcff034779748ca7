//! Cron expression helpers.
//!
//! Schedules use the 6-field second-precision form
//! (`sec min hour day-of-month month day-of-week`). A trailing 7th year
//! field is accepted for legacy inputs and ignored.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Validate a cron expression, normalizing away a legacy 7th year field.
pub fn validate(expression: &str) -> Result<(), String> {
    parse(expression).map(|_| ())
}

/// Parse a cron expression into a [`Schedule`].
pub fn parse(expression: &str) -> Result<Schedule, String> {
    let normalized = normalize(expression);
    Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression '{expression}': {e}"))
}

/// Next occurrence strictly after `after`, or `None` when the schedule has
/// no future firings (or does not parse).
pub fn next_after(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse(expression).ok()?.after(&after).next()
}

/// Whether a schedule is due: its next occurrence after `last_run`
/// (or the epoch, if never run) is at or before `now`.
pub fn is_due(expression: &str, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Ok(schedule) = parse(expression) else {
        return false;
    };
    match last_run {
        Some(last) => schedule.after(&last).next().is_some_and(|next| next <= now),
        None => schedule.upcoming(Utc).next().is_some(),
    }
}

/// Drop a legacy 7th (year) field if present; the 6-field form is canonical.
fn normalize(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 7 {
        fields[..6].join(" ")
    } else {
        fields.join(" ")
    }
}
