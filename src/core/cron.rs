use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Parsed five-field cron expression (minute hour day-of-month month
/// day-of-week). Supports `*`, lists, ranges and `/step`. Day-of-week
/// accepts both 0 and 7 for Sunday.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    minutes: [bool; 60],
    hours: [bool; 24],
    days: [bool; 32],
    months: [bool; 13],
    weekdays: [bool; 7],
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut minutes = [false; 60];
        let mut hours = [false; 24];
        let mut days = [false; 32];
        let mut months = [false; 13];
        let mut weekdays = [false; 7];

        parse_field(fields[0], "minute", 0, 59, |v| minutes[v as usize] = true)?;
        parse_field(fields[1], "hour", 0, 23, |v| hours[v as usize] = true)?;
        parse_field(fields[2], "day", 1, 31, |v| days[v as usize] = true)?;
        parse_field(fields[3], "month", 1, 12, |v| months[v as usize] = true)?;
        parse_field(fields[4], "weekday", 0, 7, |v| {
            // 7 is an alias for Sunday.
            weekdays[(v % 7) as usize] = true;
        })?;

        Ok(Self {
            source: expr.to_string(),
            minutes,
            hours,
            days,
            months,
            weekdays,
            days_restricted: fields[2] != "*",
            weekdays_restricted: fields[4] != "*",
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Standard cron semantics: when both day-of-month and day-of-week
    /// are restricted, a day matches if EITHER field matches.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days[t.day() as usize];
        let dow = self.weekdays[t.weekday().num_days_from_sunday() as usize];
        if self.days_restricted && self.weekdays_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Minute-resolution match; seconds are ignored.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes[t.minute() as usize]
            && self.hours[t.hour() as usize]
            && self.months[t.month() as usize]
            && self.day_matches(t)
    }

    /// The first matching instant strictly after `t`, truncated to the
    /// minute. Returns None only for expressions with no occurrence
    /// within a ~5 year horizon (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut cur = Utc
            .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
            .single()?
            + Duration::minutes(1);
        let horizon = cur + Duration::days(5 * 366);

        while cur < horizon {
            if !self.months[cur.month() as usize] || !self.day_matches(cur) {
                cur = Utc
                    .with_ymd_and_hms(cur.year(), cur.month(), cur.day(), 0, 0, 0)
                    .single()?
                    + Duration::days(1);
                continue;
            }
            if !self.hours[cur.hour() as usize] {
                cur = Utc
                    .with_ymd_and_hms(cur.year(), cur.month(), cur.day(), cur.hour(), 0, 0)
                    .single()?
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes[cur.minute() as usize] {
                cur += Duration::minutes(1);
                continue;
            }
            return Some(cur);
        }
        None
    }
}

fn parse_field(
    field: &str,
    name: &'static str,
    min: u32,
    max: u32,
    mut set: impl FnMut(u32),
) -> Result<(), CronError> {
    let err = || CronError::InvalidField {
        field: name,
        value: field.to_string(),
    };

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, s.parse::<u32>().map_err(|_| err())?),
            None => (part, 1),
        };
        if step == 0 {
            return Err(err());
        }

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = a.parse::<u32>().map_err(|_| err())?;
            let hi = b.parse::<u32>().map_err(|_| err())?;
            if lo > hi {
                return Err(err());
            }
            (lo, hi)
        } else {
            let v = range.parse::<u32>().map_err(|_| err())?;
            // A bare value with a step means "v, v+step, ..." up to max.
            if part.contains('/') { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max {
            return Err(err());
        }
        let mut v = lo;
        while v <= hi {
            set(v);
            v += step;
        }
    }
    Ok(())
}
