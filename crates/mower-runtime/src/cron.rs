//! Five-field cron expressions and a pure next-fire-time calculator.
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC. Each field
//! accepts `*`, single values, ranges `a-b`, lists `a,b,c` and steps `*/n` or
//! `a-b/n`. Day-of-week is `0-7` with both `0` and `7` meaning Sunday. When
//! both day fields are restricted a day matches if either one does.
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use mower_runtime::cron::CronSchedule;
//!
//! let weekday_mornings: CronSchedule = "30 7 * * 1-5".parse().unwrap();
//! // Saturday 2026-10-17 08:00 → Monday 07:30.
//! let next = weekday_mornings
//!     .next_after(Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 0).unwrap())
//!     .unwrap();
//! assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 19, 7, 30, 0).unwrap());
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// Search horizon; a schedule that never fires within it (e.g. `0 0 30 2 *`)
/// has no next fire time.
const HORIZON_DAYS: u32 = 4 * 366;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

/// Parse one field into a bitmask indexed by value. Returns the mask and
/// whether the field was anything other than a bare `*`.
fn parse_field(raw: &str, spec: &FieldSpec) -> Result<(u64, bool), CronError> {
    let invalid = || CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
    };
    let number = |s: &str| -> Result<u32, CronError> {
        let v: u32 = s.parse().map_err(|_| invalid())?;
        if v < spec.min || v > spec.max {
            return Err(CronError::OutOfRange {
                field: spec.name,
                value: v,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(v)
    };

    let mut mask = 0u64;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = match range {
            "*" => (spec.min, spec.max),
            _ => match range.split_once('-') {
                Some((a, b)) => {
                    let (a, b) = (number(a)?, number(b)?);
                    if a > b {
                        return Err(invalid());
                    }
                    (a, b)
                }
                // `5/15` means 5, 20, 35, 50.
                None if step > 1 => (number(range)?, spec.max),
                None => {
                    let v = number(range)?;
                    (v, v)
                }
            },
        };
        for v in (lo..=hi).step_by(step as usize) {
            mask |= 1 << v;
        }
    }
    Ok((mask, raw != "*"))
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields[..] else {
            return Err(CronError::FieldCount(fields.len()));
        };
        let (minutes, _) = parse_field(minute, &MINUTE)?;
        let (hours, _) = parse_field(hour, &HOUR)?;
        let (days_of_month, dom_restricted) = parse_field(dom, &DAY_OF_MONTH)?;
        let (months, _) = parse_field(month, &MONTH)?;
        let (mut days_of_week, dow_restricted) = parse_field(dow, &DAY_OF_WEEK)?;
        // Fold 7 onto 0 (Sunday).
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & 0x7f;
        }
        Ok(Self {
            source: fields.join(" "),
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted,
            dow_restricted,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First fire time strictly after `after`, at whole-minute resolution.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after + Duration::minutes(1);
        let mut date = start.date_naive();
        let mut first_minute = start.hour() * 60 + start.minute();

        for _ in 0..HORIZON_DAYS {
            if self.day_matches(date) {
                for minute_of_day in first_minute..24 * 60 {
                    let (h, m) = (minute_of_day / 60, minute_of_day % 60);
                    if self.hours & (1 << h) != 0 && self.minutes & (1 << m) != 0 {
                        return date.and_hms_opt(h, m, 0).map(|t| t.and_utc());
                    }
                }
            }
            date = date.succ_opt()?;
            first_minute = 0;
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
