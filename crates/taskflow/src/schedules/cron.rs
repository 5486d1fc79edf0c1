//! Five-field cron expressions: "MIN HOUR DOM MON DOW", evaluated in UTC.
//!
//! Each field accepts `*`, `N`, `N-M`, `*/S`, `N-M/S`, `N/S` and comma
//! lists. Months accept `JAN`..`DEC`, weekdays `SUN`..`SAT` (0 and 7 are
//! both Sunday). When both day fields are restricted a day matches if
//! either one does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expr}': expected 5 fields, got {got}")]
    FieldCount { expr: String, got: usize },

    #[error("invalid cron field '{field}': {reason}")]
    Field { field: String, reason: String },
}

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Nothing further than this is searched before giving up.
const MAX_LOOKAHEAD_YEARS: i32 = 5;

/// Bitset over the allowed values of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, v: u32) -> bool {
        self.bits & (1 << v) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount {
                expr: expr.to_string(),
                got: parts.len(),
            });
        }

        let mut days_of_week = parse_field(parts[4], 0, 7, Some(&WEEKDAYS[..]))?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: parse_field(parts[0], 0, 59, None)?,
            hours: parse_field(parts[1], 0, 23, None)?,
            days_of_month: parse_field(parts[2], 1, 31, None)?,
            months: parse_field(parts[3], 1, 12, Some(&MONTHS[..]))?,
            days_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes.contains(t.minute())
            && self.hours.contains(t.hour())
            && self.months.contains(t.month())
            && self.day_matches(t.date_naive())
    }

    fn day_matches(&self, d: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(d.day());
        let dow = self.days_of_week.contains(d.weekday().num_days_from_sunday());

        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit_year = start.year() + MAX_LOOKAHEAD_YEARS;
        let mut t = start;

        while t.year() <= limit_year {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = midnight(t.date_naive().succ_opt()?);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }

        None
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn midnight(d: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN))
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (y, m) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).map(midnight)
}

fn field_err(field: &str, reason: impl Into<String>) -> CronError {
    CronError::Field {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn parse_value(
    raw: &str,
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<u32, CronError> {
    let upper = raw.to_ascii_uppercase();
    if let Some(names) = names {
        if let Some(idx) = names.iter().position(|n| *n == upper) {
            // Month names are 1-based, weekday names 0-based.
            let base = if names.len() == MONTHS.len() { 1 } else { 0 };
            return Ok(idx as u32 + base);
        }
    }

    let v: u32 = raw
        .parse()
        .map_err(|_| field_err(field, format!("'{raw}' is not a number")))?;
    if v < min || v > max {
        return Err(field_err(
            field,
            format!("{v} out of range {min}-{max}"),
        ));
    }
    Ok(v)
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<FieldSet, CronError> {
    if field == "*" {
        return Ok(FieldSet {
            bits: range_bits(min, max, 1),
            restricted: false,
        });
    }

    let mut bits = 0u64;
    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(field_err(field, "empty list element"));
        }

        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| field_err(field, format!("bad step '{s}'")))?;
                if step == 0 {
                    return Err(field_err(field, "step must be positive"));
                }
                (r, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, field, min, max, names)?;
            let hi = parse_value(b, field, min, max, names)?;
            if lo > hi {
                return Err(field_err(field, format!("range {lo}-{hi} is reversed")));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, field, min, max, names)?;
            // "N/S" runs from N to the end of the field.
            (v, if step.is_some() { max } else { v })
        };

        bits |= range_bits(lo, hi, step.unwrap_or(1));
    }

    Ok(FieldSet {
        bits,
        restricted: !field.starts_with('*'),
    })
}

fn range_bits(lo: u32, hi: u32, step: u32) -> u64 {
    (lo..=hi)
        .step_by(step as usize)
        .fold(0u64, |acc, v| acc | (1 << v))
}
