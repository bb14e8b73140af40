//! Schedule parsing and next-tick calculation.
//!
//! A job's `time` field is either a cron expression (recurring) or an
//! absolute date/time (one-off). Classification is purely syntactic: a
//! value with 5 or 6 whitespace-separated fields is treated as cron first,
//! and anything that fails cron parsing falls back to a lenient one-off
//! interpretation in the job's timezone.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One-off formats accepted besides RFC 3339 and epoch milliseconds.
/// Naive values are interpreted in the schedule's timezone.
const LENIENT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Whether a time specification is shaped like a cron expression.
///
/// This is a syntactic check only (5 or 6 whitespace-separated fields),
/// not a semantic validation. It decides recurring-vs-one-off policy: a
/// recurring schedule always has a next occurrence, while a one-off
/// schedule is exhausted once its instant has passed.
pub fn is_cron_syntax(time: &str) -> bool {
    let fields = time.split_whitespace().count();
    (5..=6).contains(&fields)
}

/// Whether a timezone string names a valid IANA timezone.
pub fn is_valid_timezone(time_zone: &str) -> bool {
    time_zone.parse::<Tz>().is_ok()
}

/// Whether a time specification has any interpretation at all, cron or
/// one-off. Used by request validation; a valid-but-past one-off is still
/// "valid" here and is rejected separately when no future tick exists.
pub fn is_valid_time(time: &str, time_zone: &str) -> bool {
    let Ok(tz) = time_zone.parse::<Tz>() else {
        return false;
    };

    if is_cron_syntax(time) && parse_cron(time).is_some() {
        return true;
    }

    parse_instant(time, tz).is_some()
}

/// A job's schedule: a time specification plus the timezone it is
/// evaluated in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    time: String,
    time_zone: String,
}

impl Schedule {
    /// Create a schedule from a time specification and IANA timezone.
    pub fn new(time: impl Into<String>, time_zone: impl Into<String>) -> Self {
        Self {
            time: time.into(),
            time_zone: time_zone.into(),
        }
    }

    /// Compute the next firing instant strictly after `after`.
    ///
    /// Returns `None` when the schedule has no further occurrence: a
    /// one-off instant that has already passed, or a specification with
    /// no interpretation at all (fail closed rather than loop). Cron
    /// schedules always produce a next occurrence.
    pub fn next_tick(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz: Tz = self.time_zone.parse().ok()?;

        if is_cron_syntax(&self.time) {
            if let Some(schedule) = parse_cron(&self.time) {
                return schedule
                    .after(&after.with_timezone(&tz))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc));
            }
            // Cron-shaped but unparseable as cron: fall through and try
            // the one-off interpretation.
        }

        let instant = parse_instant(&self.time, tz)?;
        (instant > after).then_some(instant)
    }

    /// Compute the next firing instant after now, as epoch milliseconds.
    pub fn next_tick_ms(&self, after: DateTime<Utc>) -> Option<i64> {
        self.next_tick(after).map(|dt| dt.timestamp_millis())
    }

    /// Whether this schedule recurs (cron-shaped specification).
    pub fn is_recurring(&self) -> bool {
        is_cron_syntax(&self.time)
    }

    /// The raw time specification.
    pub fn time(&self) -> &str {
        &self.time
    }

    /// The timezone name.
    pub fn time_zone(&self) -> &str {
        &self.time_zone
    }
}

/// Parse a cron-shaped specification. 5-field expressions get a seconds
/// field prepended so both standard and extended forms are accepted.
fn parse_cron(time: &str) -> Option<CronSchedule> {
    let fields = time.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", time.trim()),
        6 => time.trim().to_string(),
        _ => return None,
    };

    CronSchedule::from_str(&normalized).ok()
}

/// Lenient one-off parse: epoch milliseconds, RFC 3339, or a naive local
/// date/time interpreted in `tz`.
fn parse_instant(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ms) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in LENIENT_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            // earliest() picks the first wall-clock mapping across DST gaps
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }

    None
}
