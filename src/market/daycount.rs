//! Day-count conventions used by the scripting `dcf`/`days` builtins and the
//! simulation date grid.

use chrono::{Datelike, NaiveDate};

/// Supported day-count conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayCountConvention {
    Act360,
    Act365Fixed,
    Thirty360,
}

/// Parses a convention name as it appears in scripts and configuration.
pub fn parse_day_counter(name: &str) -> Result<DayCountConvention, String> {
    match name {
        "A360" | "ACT/360" | "Actual/360" => Ok(DayCountConvention::Act360),
        "A365F" | "ACT/365" | "Actual/365 (Fixed)" => Ok(DayCountConvention::Act365Fixed),
        "30/360" | "Thirty360" => Ok(DayCountConvention::Thirty360),
        other => Err(format!("unknown day counter '{other}'")),
    }
}

/// Year fraction between two dates. Negative when `start > end`.
pub fn year_fraction(start: NaiveDate, end: NaiveDate, convention: DayCountConvention) -> f64 {
    if start == end {
        return 0.0;
    }
    if start > end {
        return -year_fraction(end, start, convention);
    }
    match convention {
        DayCountConvention::Act360 => (end - start).num_days() as f64 / 360.0,
        DayCountConvention::Act365Fixed => (end - start).num_days() as f64 / 365.0,
        DayCountConvention::Thirty360 => year_fraction_thirty_360(start, end),
    }
}

/// Day count between two dates under the convention.
pub fn day_count(start: NaiveDate, end: NaiveDate, convention: DayCountConvention) -> i64 {
    match convention {
        DayCountConvention::Act360 | DayCountConvention::Act365Fixed => (end - start).num_days(),
        DayCountConvention::Thirty360 => {
            let (d1, d2) = thirty_360_days(start, end);
            360 * (end.year() as i64 - start.year() as i64)
                + 30 * (end.month() as i64 - start.month() as i64)
                + (d2 - d1)
        }
    }
}

fn thirty_360_days(start: NaiveDate, end: NaiveDate) -> (i64, i64) {
    let mut d1 = start.day() as i64;
    let mut d2 = end.day() as i64;
    if d1 == 31 {
        d1 = 30;
    }
    if d2 == 31 && d1 == 30 {
        d2 = 30;
    }
    (d1, d2)
}

fn year_fraction_thirty_360(start: NaiveDate, end: NaiveDate) -> f64 {
    day_count(start, end, DayCountConvention::Thirty360) as f64 / 360.0
}
