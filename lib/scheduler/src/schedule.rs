//! Five-field cron-style schedule evaluation.
//!
//! Evaluates a schedule's next/previous firing moment relative to a
//! reference, by a fixed-point field search: test fields in priority
//! order month, day-of-month, weekday, hour,
//! minute; on the first mismatch, jump to the start (searching
//! forward) or end (searching backward) of the next candidate window
//! for that field, then restart the test from the top. Progress is
//! monotonic in the search direction, so the loop is bounded by a
//! single year.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use cadence_core::Moment;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One field of a [`Schedule`]: either unconstrained or pinned to a
/// single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronField {
    /// Matches any value (`*`).
    Wildcard,
    /// Matches only this value.
    Fixed(u32),
}

impl CronField {
    fn fixed(self) -> Option<u32> {
        match self {
            Self::Wildcard => None,
            Self::Fixed(v) => Some(v),
        }
    }

    fn parse(raw: &str, domain: std::ops::RangeInclusive<u32>) -> Result<Self, ScheduleError> {
        if raw == "*" {
            return Ok(Self::Wildcard);
        }
        let value: u32 = raw.parse().map_err(|_| ScheduleError::BadSpec {
            reason: format!("field '{raw}' is not a wildcard or integer"),
        })?;
        if !domain.contains(&value) {
            return Err(ScheduleError::BadSpec {
                reason: format!(
                    "field value {value} outside domain {}..={}",
                    domain.start(),
                    domain.end()
                ),
            });
        }
        Ok(Self::Fixed(value))
    }
}

/// Errors constructing or evaluating a [`Schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The cron spec had the wrong field count or an out-of-domain value.
    BadSpec { reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSpec { reason } => write!(f, "bad cron spec: {reason}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// An immutable five-field cron-style schedule.
///
/// Domains: minute 0-59, hour 0-23, day-of-month 1-31, month 1-12,
/// weekday 0-6 (Monday = 0). No ranges, lists, steps, or names — a
/// field is either `*` or a single integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    weekday: CronField,
}

impl Schedule {
    /// Parses a five-field cron spec (`minute hour day-of-month month weekday`).
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::BadSpec`] if the field count is not 5
    /// or a field is outside its domain.
    pub fn parse(spec: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::BadSpec {
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }

        Ok(Self {
            minute: CronField::parse(fields[0], 0..=59)?,
            hour: CronField::parse(fields[1], 0..=23)?,
            day_of_month: CronField::parse(fields[2], 1..=31)?,
            month: CronField::parse(fields[3], 1..=12)?,
            weekday: CronField::parse(fields[4], 0..=6)?,
        })
    }

    /// The next moment at or after (`inclusive`) / strictly after
    /// (not `inclusive`) `reference` that matches every non-wildcard
    /// field.
    #[must_use]
    pub fn next(&self, reference: Moment, inclusive: bool) -> Moment {
        let mut t = reference.naive().with_second(0).unwrap().with_nanosecond(0).unwrap();
        if !inclusive {
            t += chrono::Duration::minutes(1);
        }

        loop {
            if let Some(month) = self.month.fixed() {
                if t.month() != month {
                    t = start_of_next_month(t);
                    continue;
                }
            }
            if let Some(day) = self.day_of_month.fixed() {
                if t.day() != day {
                    t = start_of_next_day(t);
                    continue;
                }
            }
            if let Some(weekday) = self.weekday.fixed() {
                if t.weekday().num_days_from_monday() != weekday {
                    t = start_of_next_day(t);
                    continue;
                }
            }
            if let Some(hour) = self.hour.fixed() {
                if t.hour() != hour {
                    t = start_of_next_hour(t);
                    continue;
                }
            }
            if let Some(minute) = self.minute.fixed() {
                if t.minute() != minute {
                    t += chrono::Duration::minutes(1);
                    continue;
                }
            }
            return Moment::from_naive(t);
        }
    }

    /// The previous moment at or before (`inclusive`) / strictly
    /// before (not `inclusive`) `reference` that matches every
    /// non-wildcard field.
    #[must_use]
    pub fn previous(&self, reference: Moment, inclusive: bool) -> Moment {
        let mut t = reference.naive().with_second(0).unwrap().with_nanosecond(0).unwrap();
        if !inclusive {
            t -= chrono::Duration::minutes(1);
        }

        loop {
            if let Some(month) = self.month.fixed() {
                if t.month() != month {
                    t = end_of_previous_month(t);
                    continue;
                }
            }
            if let Some(day) = self.day_of_month.fixed() {
                if t.day() != day {
                    t = end_of_previous_day(t);
                    continue;
                }
            }
            if let Some(weekday) = self.weekday.fixed() {
                if t.weekday().num_days_from_monday() != weekday {
                    t = end_of_previous_day(t);
                    continue;
                }
            }
            if let Some(hour) = self.hour.fixed() {
                if t.hour() != hour {
                    t = end_of_previous_hour(t);
                    continue;
                }
            }
            if let Some(minute) = self.minute.fixed() {
                if t.minute() != minute {
                    t -= chrono::Duration::minutes(1);
                    continue;
                }
            }
            return Moment::from_naive(t);
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid date")
        .pred_opt()
        .expect("valid date")
        .day()
}

fn start_of_next_month(t: NaiveDateTime) -> NaiveDateTime {
    let (year, month) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
    NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid date")
        .and_time(NaiveTime::MIN)
}

fn end_of_previous_month(t: NaiveDateTime) -> NaiveDateTime {
    let (year, month) = if t.month() == 1 { (t.year() - 1, 12) } else { (t.year(), t.month() - 1) };
    let day = days_in_month(year, month);
    NaiveDate::from_ymd_opt(year, month, day)
        .expect("valid date")
        .and_hms_opt(23, 59, 0)
        .expect("valid time")
}

fn start_of_next_day(t: NaiveDateTime) -> NaiveDateTime {
    (t.date() + chrono::Duration::days(1)).and_time(NaiveTime::MIN)
}

fn end_of_previous_day(t: NaiveDateTime) -> NaiveDateTime {
    (t.date() - chrono::Duration::days(1))
        .and_hms_opt(23, 59, 0)
        .expect("valid time")
}

fn start_of_next_hour(t: NaiveDateTime) -> NaiveDateTime {
    let next = t + chrono::Duration::hours(1);
    next.date().and_hms_opt(next.hour(), 0, 0).expect("valid time")
}

fn end_of_previous_hour(t: NaiveDateTime) -> NaiveDateTime {
    let prev = t - chrono::Duration::hours(1);
    prev.date().and_hms_opt(prev.hour(), 59, 0).expect("valid time")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moment(s: &str) -> Moment {
        s.parse().expect("valid canonical moment")
    }

    #[test]
    fn every_minute_tick() {
        let s = Schedule::parse("* * * * *").unwrap();
        let reference = moment("2021-09-22T12:30:00");
        assert_eq!(s.next(reference, true), moment("2021-09-22T12:31:00"));
        assert_eq!(s.previous(reference, true), moment("2021-09-22T12:29:00"));
    }

    #[test]
    fn cross_month_rollover_next() {
        let s = Schedule::parse("10 * 31 * *").unwrap();
        let reference = moment("2021-02-25T12:10:00");
        assert_eq!(s.next(reference, true), moment("2021-03-31T00:10:00"));
    }

    #[test]
    fn cross_month_rollover_previous() {
        let s = Schedule::parse("10 * 31 * *").unwrap();
        let reference = moment("2021-02-25T12:10:00");
        assert_eq!(s.previous(reference, true), moment("2021-01-31T23:10:00"));
    }

    #[test]
    fn inclusive_flag_controls_boundary() {
        let s = Schedule::parse("30 12 * * *").unwrap();
        let reference = moment("2021-09-22T12:30:00");
        assert_eq!(s.next(reference, true), reference);
        assert!(s.next(reference, false) > reference);
        assert_eq!(s.previous(reference, true), reference);
        assert!(s.previous(reference, false) < reference);
    }

    #[test]
    fn day_of_month_and_weekday_are_conjunctive() {
        // 2021-09-22 is a Wednesday (weekday0 = 2). Asking for day=22
        // AND weekday=Monday (0) should skip past this date even
        // though the day-of-month matches.
        let s = Schedule::parse("0 0 22 * 0").unwrap();
        let reference = moment("2021-09-22T00:00:00");
        let next = s.next(reference, false);
        assert_ne!(next.naive().date(), reference.naive().date());
        assert_eq!(next.weekday0(), 0);
        assert_eq!(next.day(), 22);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = Schedule::parse("* * * *").unwrap_err();
        assert!(matches!(err, ScheduleError::BadSpec { .. }));
    }

    #[test]
    fn rejects_out_of_domain_value() {
        let err = Schedule::parse("60 * * * *").unwrap_err();
        assert!(matches!(err, ScheduleError::BadSpec { .. }));
    }

    #[test]
    fn rejects_non_numeric_field() {
        let err = Schedule::parse("mon * * * *").unwrap_err();
        assert!(matches!(err, ScheduleError::BadSpec { .. }));
    }

    #[test]
    fn next_never_before_reference_inclusive() {
        let s = Schedule::parse("15 9 * * *").unwrap();
        for ref_str in ["2021-01-01T00:00:00", "2021-06-15T09:15:00", "2021-12-31T23:59:00"] {
            let reference = moment(ref_str);
            assert!(s.next(reference, true) >= reference);
            assert!(s.previous(reference, true) <= reference);
            assert!(s.next(reference, false) > reference);
            assert!(s.previous(reference, false) < reference);
        }
    }
}
