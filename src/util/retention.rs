use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use derive_more::{Display, Error};
use regex::Regex;

static RELATIVE_AGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*([hdw])\s*$").unwrap());

/// Age based retention of timestamps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Retention {
    /// Defines for how many days backups are kept.
    pub days: u32,
    cutoff: DateTime<Utc>,
}

impl Retention {
    /// Retention of `days` days, evaluated at `now`.
    pub fn new(days: u32, now: DateTime<Utc>) -> Self {
        let cutoff = now - Duration::days(days.into());
        Self { days, cutoff }
    }

    /// Oldest timestamp still retained.
    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }

    /// Returns if the timestamp is to be retained.
    pub fn retain(&self, timestamp: &DateTime<Utc>) -> bool {
        *timestamp >= self.cutoff
    }
}

/// Point in time given by the user is not understood.
#[derive(Debug, Display, Error)]
#[display("Unable to parse point in time {_0:?}, expected e.g. 7d, 12h, 2w, 2024-05-01 or an RFC 3339 timestamp")]
pub struct InvalidAge(#[error(ignore)] String);

/// Parses a point in time relative to `now`.
///
/// Accepts relative ages (`12h`, `7d`, `2w`), RFC 3339 timestamps and dates
/// (`YYYY-MM-DD`, midnight UTC).
pub fn parse_since(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, InvalidAge> {
    let invalid = || InvalidAge(input.to_string());

    if let Some(captures) = RELATIVE_AGE.captures(input) {
        let amount: i64 = captures[1].parse().map_err(|_| invalid())?;
        let age = match &captures[2] {
            "h" => Duration::try_hours(amount),
            "d" => Duration::try_days(amount),
            "w" => Duration::try_weeks(amount),
            _ => None,
        }
        .ok_or_else(invalid)?;
        return now.checked_sub_signed(age).ok_or_else(invalid);
    }

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(input.trim()) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(invalid)
}
