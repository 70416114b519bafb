//! Extended cron expressions.
//!
//! Five fields (`minute hour day-of-month month day-of-week`) with an optional
//! sixth year field, or one of the `@daily`-style macros. Matching timestamps
//! are produced lazily for a bounded window in any chrono timezone.

mod field;

use crate::error::{OpsError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use field::{Field, FieldKind};
use std::fmt;
use std::str::FromStr;

pub(crate) use field::days_in_month;

const MACROS: [(&str, &str); 6] = [
    ("@yearly", "0 0 1 1 ?"),
    ("@annually", "0 0 1 1 ?"),
    ("@monthly", "0 0 1 * ?"),
    ("@weekly", "0 0 ? * mon"),
    ("@daily", "0 0 * * ?"),
    ("@hourly", "0 * * * ?"),
];

// ---------------------------------------------------------------------------
// CronExpression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
    years: Field,
}

impl CronExpression {
    /// Parse an expression. All syntax errors surface here, never while iterating.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            MACROS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
                .map(|(_, body)| *body)
                .ok_or_else(|| OpsError::cron(expression, "unknown macro"))?
        } else {
            trimmed
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 && parts.len() != 6 {
            return Err(OpsError::cron(
                expression,
                format!("expected 5 or 6 fields, found {}", parts.len()),
            ));
        }

        Ok(CronExpression {
            source: expression.trim().to_string(),
            minutes: Field::parse(FieldKind::Minute, parts[0], expression)?,
            hours: Field::parse(FieldKind::Hour, parts[1], expression)?,
            days_of_month: Field::parse(FieldKind::DayOfMonth, parts[2], expression)?,
            months: Field::parse(FieldKind::Month, parts[3], expression)?,
            days_of_week: Field::parse(FieldKind::DayOfWeek, parts[4], expression)?,
            years: Field::parse(FieldKind::Year, parts.get(5).copied().unwrap_or("*"), expression)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether a local wall-clock minute matches every field.
    pub fn matches(&self, local: NaiveDateTime) -> bool {
        self.years.contains(local.year() as u32)
            && self.months.contains(local.month())
            && self.day_mask(local.year(), local.month()) & (1 << local.day()) != 0
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
    }

    /// Matches in `(start, start + timespan]`, oldest first.
    pub fn within_next<Tz: TimeZone>(
        &self,
        timespan: Duration,
        start: DateTime<Tz>,
    ) -> CronWindow<'_, Tz> {
        let end = start.clone() + timespan;
        CronWindow {
            expr: self,
            start,
            end,
        }
    }

    /// Matches in `(end - timespan, end]`, oldest first.
    pub fn within_last<Tz: TimeZone>(
        &self,
        timespan: Duration,
        end: DateTime<Tz>,
    ) -> CronWindow<'_, Tz> {
        let start = end.clone() - timespan;
        CronWindow {
            expr: self,
            start,
            end,
        }
    }

    pub fn first_within_next<Tz: TimeZone>(
        &self,
        timespan: Duration,
        start: DateTime<Tz>,
    ) -> Option<DateTime<Tz>> {
        self.within_next(timespan, start).iter().next()
    }

    /// Most recent match in `(since, end]`.
    pub fn last_since<Tz: TimeZone>(
        &self,
        since: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Option<DateTime<Tz>> {
        if end <= since {
            return None;
        }
        CronWindow {
            expr: self,
            start: since,
            end,
        }
        .iter_rev()
        .next()
    }

    fn day_mask(&self, year: i32, month: u32) -> u32 {
        let dom = if self.days_of_month.is_unrestricted() {
            u32::MAX
        } else {
            self.days_of_month.day_mask(year, month)
        };
        let dow = if self.days_of_week.is_unrestricted() {
            u32::MAX
        } else {
            self.days_of_week.day_mask(year, month)
        };
        let valid = (u32::MAX >> (31 - days_in_month(year, month))) & !1;
        dom & dow & valid
    }
}

impl FromStr for CronExpression {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        CronExpression::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// CronWindow
// ---------------------------------------------------------------------------

/// A bounded window over an expression. Iterating it twice yields the same
/// sequence; nothing is computed until an iterator is pulled.
#[derive(Debug, Clone)]
pub struct CronWindow<'a, Tz: TimeZone> {
    expr: &'a CronExpression,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
}

impl<'a, Tz: TimeZone> CronWindow<'a, Tz> {
    pub fn start(&self) -> &DateTime<Tz> {
        &self.start
    }

    pub fn end(&self) -> &DateTime<Tz> {
        &self.end
    }

    pub fn iter(&self) -> CronIter<'a, Tz> {
        CronIter::new(self, Direction::Forward)
    }

    /// Newest first.
    pub fn iter_rev(&self) -> CronIter<'a, Tz> {
        CronIter::new(self, Direction::Backward)
    }
}

impl<'a, Tz: TimeZone> IntoIterator for &CronWindow<'a, Tz> {
    type Item = DateTime<Tz>;
    type IntoIter = CronIter<'a, Tz>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

pub struct CronIter<'a, Tz: TimeZone> {
    expr: &'a CronExpression,
    tz: Tz,
    lower: DateTime<Tz>,
    upper: DateTime<Tz>,
    lower_local: NaiveDateTime,
    upper_local: NaiveDateTime,
    cursor: Option<NaiveDateTime>,
    direction: Direction,
    previous: Option<DateTime<Tz>>,
    month_cache: Option<(i32, u32, u32)>,
}

impl<'a, Tz: TimeZone> CronIter<'a, Tz> {
    fn new(window: &CronWindow<'a, Tz>, direction: Direction) -> Self {
        let lower_local = truncate_minute(window.start.naive_local());
        let upper_local = truncate_minute(window.end.naive_local());
        let cursor = match direction {
            Direction::Forward => lower_local.checked_add_signed(Duration::minutes(1)),
            Direction::Backward => Some(upper_local),
        };
        CronIter {
            expr: window.expr,
            tz: window.start.timezone(),
            lower: window.start.clone(),
            upper: window.end.clone(),
            lower_local,
            upper_local,
            cursor,
            direction,
            previous: None,
            month_cache: None,
        }
    }

    fn day_matches(&mut self, t: NaiveDateTime) -> bool {
        let (year, month) = (t.year(), t.month());
        let mask = match self.month_cache {
            Some((y, m, mask)) if y == year && m == month => mask,
            _ => {
                let mask = self.expr.day_mask(year, month);
                self.month_cache = Some((year, month, mask));
                mask
            }
        };
        mask & (1 << t.day()) != 0
    }

    fn next_forward(&mut self, mut t: NaiveDateTime) -> Option<NaiveDateTime> {
        while t <= self.upper_local {
            let expr = self.expr;
            t = if !expr.years.contains(t.year() as u32) {
                start_of_day(NaiveDate::from_ymd_opt(t.year() + 1, 1, 1)?)
            } else if !expr.months.contains(t.month()) {
                start_of_day(first_of_next_month(t.date())?)
            } else if !self.day_matches(t) {
                start_of_day(t.date().succ_opt()?)
            } else if !expr.hours.contains(t.hour()) {
                truncate_hour(t).checked_add_signed(Duration::hours(1))?
            } else if !expr.minutes.contains(t.minute()) {
                t.checked_add_signed(Duration::minutes(1))?
            } else {
                return Some(t);
            };
        }
        None
    }

    fn next_backward(&mut self, mut t: NaiveDateTime) -> Option<NaiveDateTime> {
        let one = Duration::minutes(1);
        while t > self.lower_local {
            let expr = self.expr;
            t = if !expr.years.contains(t.year() as u32) {
                start_of_day(NaiveDate::from_ymd_opt(t.year(), 1, 1)?).checked_sub_signed(one)?
            } else if !expr.months.contains(t.month()) {
                start_of_day(t.date().with_day(1)?).checked_sub_signed(one)?
            } else if !self.day_matches(t) {
                start_of_day(t.date()).checked_sub_signed(one)?
            } else if !expr.hours.contains(t.hour()) {
                truncate_hour(t).checked_sub_signed(one)?
            } else if !expr.minutes.contains(t.minute()) {
                t.checked_sub_signed(one)?
            } else {
                return Some(t);
            };
        }
        None
    }
}

impl<'a, Tz: TimeZone> Iterator for CronIter<'a, Tz> {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<DateTime<Tz>> {
        loop {
            let cursor = self.cursor?;
            let found = match self.direction {
                Direction::Forward => self.next_forward(cursor),
                Direction::Backward => self.next_backward(cursor),
            };
            let Some(local) = found else {
                self.cursor = None;
                return None;
            };
            self.cursor = match self.direction {
                Direction::Forward => local.checked_add_signed(Duration::minutes(1)),
                Direction::Backward => local.checked_sub_signed(Duration::minutes(1)),
            };

            // Local times inside a DST gap do not exist and are skipped.
            let Some(instant) = self.tz.from_local_datetime(&local).earliest() else {
                continue;
            };
            if instant <= self.lower || instant > self.upper {
                continue;
            }
            let ordered = match (&self.previous, self.direction) {
                (None, _) => true,
                (Some(prev), Direction::Forward) => instant > *prev,
                (Some(prev), Direction::Backward) => instant < *prev,
            };
            if !ordered {
                continue;
            }
            self.previous = Some(instant.clone());
            return Some(instant);
        }
    }
}

fn truncate_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn truncate_hour(t: NaiveDateTime) -> NaiveDateTime {
    t.date().and_time(NaiveTime::from_hms_opt(t.hour(), 0, 0).unwrap_or(NaiveTime::MIN))
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}
