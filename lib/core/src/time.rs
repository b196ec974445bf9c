//! Canonical wall-clock time representation.
//!
//! All scheduling in this daemon is performed at minute resolution in
//! local wall-clock time. [`Moment`] is the single shared parse/format
//! implementation for the canonical
//! `%Y-%m-%dT%H:%M:%S` representation used in the ledger, the control
//! channel's qualified task names, and log file names.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A minute-resolution, local wall-clock moment in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Moment(NaiveDateTime);

/// Error returned when a canonical time string fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMomentError {
    input: String,
}

impl fmt::Display for ParseMomentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid canonical time '{}'", self.input)
    }
}

impl std::error::Error for ParseMomentError {}

impl Moment {
    /// The current local wall-clock moment, truncated to the minute.
    #[must_use]
    pub fn now() -> Self {
        Self::from_naive(Local::now().naive_local())
    }

    /// Wraps a [`chrono::NaiveDateTime`], truncating seconds away.
    #[must_use]
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        Self(dt.with_second(0).and_then(|d| d.with_nanosecond(0)).unwrap_or(dt))
    }

    /// The sentinel far-future instant used for manual-only routines.
    #[must_use]
    pub fn far_future() -> Self {
        Self::from_naive(
            chrono::NaiveDate::from_ymd_opt(9999, 12, 31)
                .expect("valid date")
                .and_hms_opt(23, 59, 0)
                .expect("valid time"),
        )
    }

    /// The underlying [`chrono::NaiveDateTime`].
    #[must_use]
    pub fn naive(&self) -> NaiveDateTime {
        self.0
    }

    #[must_use]
    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    #[must_use]
    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    #[must_use]
    pub fn day(&self) -> u32 {
        self.0.day()
    }

    #[must_use]
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    #[must_use]
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// ISO weekday with Monday = 0.
    #[must_use]
    pub fn weekday0(&self) -> u32 {
        self.0.weekday().num_days_from_monday()
    }

    /// Returns this moment plus the given number of whole minutes.
    #[must_use]
    pub fn plus_minutes(&self, minutes: i64) -> Self {
        Self::from_naive(self.0 + chrono::Duration::minutes(minutes))
    }

    /// The canonical filesystem-safe form (`:` replaced with `-`), used
    /// for log file names.
    #[must_use]
    pub fn filesystem_safe(&self) -> String {
        self.to_string().replace(':', "-")
    }
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CANONICAL_FORMAT))
    }
}

impl FromStr for Moment {
    type Err = ParseMomentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDateTime::parse_from_str(s, CANONICAL_FORMAT)
            .map(Self::from_naive)
            .map_err(|_| ParseMomentError { input: s.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_canonical_string() {
        let m: Moment = "2021-09-22T12:30:00".parse().expect("parses");
        assert_eq!(m.to_string(), "2021-09-22T12:30:00");
    }

    #[test]
    fn truncates_seconds_on_construction() {
        let dt = chrono::NaiveDate::from_ymd_opt(2021, 9, 22)
            .unwrap()
            .and_hms_opt(12, 30, 45)
            .unwrap();
        let m = Moment::from_naive(dt);
        assert_eq!(m.to_string(), "2021-09-22T12:30:00");
    }

    #[test]
    fn rejects_malformed_input() {
        let result: Result<Moment, _> = "not-a-time".parse();
        assert!(result.is_err());
    }

    #[test]
    fn far_future_is_later_than_now() {
        assert!(Moment::far_future() > Moment::now());
    }

    #[test]
    fn filesystem_safe_replaces_colons() {
        let m: Moment = "2021-09-22T12:30:00".parse().unwrap();
        assert_eq!(m.filesystem_safe(), "2021-09-22T12-30-00");
    }

    #[test]
    fn weekday0_monday_is_zero() {
        // 2021-09-20 is a Monday.
        let m: Moment = "2021-09-20T00:00:00".parse().unwrap();
        assert_eq!(m.weekday0(), 0);
    }
}
