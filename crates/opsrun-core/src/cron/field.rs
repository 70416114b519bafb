use crate::error::{OpsError, Result};
use chrono::{Datelike, NaiveDate};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

// Monday is 0, matching chrono's `num_days_from_monday`.
const WEEKDAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

// ---------------------------------------------------------------------------
// FieldKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
    Year,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
            FieldKind::Year => "year",
        }
    }

    pub fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 6),
            FieldKind::Year => (1970, 2199),
        }
    }

    /// Month and weekday ranges may run past the end of the cycle (`nov-feb`, `fri-mon`).
    fn wraps(self) -> bool {
        matches!(self, FieldKind::Month | FieldKind::DayOfWeek)
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Calendar-dependent entries that can only be resolved for a concrete year and month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalendarItem {
    /// `L` in day-of-month: the last day of the month.
    LastDay,
    /// `nW`: the weekday closest to day `n` without leaving the month.
    NearestWeekday(u32),
    /// `nL` in day-of-week: the last occurrence of weekday `n` in the month.
    LastWeekday(u32),
    /// `n#k`: the k-th occurrence of weekday `n` in the month.
    NthWeekday { weekday: u32, nth: u32 },
}

/// One parsed cron field: a static value set plus calendar-dependent items.
#[derive(Debug, Clone)]
pub(crate) struct Field {
    kind: FieldKind,
    values: Vec<bool>,
    calendar: Vec<CalendarItem>,
    unrestricted: bool,
}

impl Field {
    pub fn parse(kind: FieldKind, text: &str, expression: &str) -> Result<Self> {
        let (min, max) = kind.bounds();
        let mut field = Field {
            kind,
            values: vec![false; (max - min + 1) as usize],
            calendar: Vec::new(),
            unrestricted: false,
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(OpsError::cron(expression, format!("empty {} field", kind.name())));
        }
        if text == "*" || text == "?" {
            field.unrestricted = true;
            field.values.iter_mut().for_each(|v| *v = true);
            return Ok(field);
        }

        for item in text.split(',') {
            field.parse_item(item.trim(), expression)?;
        }
        Ok(field)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }

    pub fn contains(&self, value: u32) -> bool {
        let (min, max) = self.kind.bounds();
        if value < min || value > max {
            return false;
        }
        self.values[(value - min) as usize]
    }

    fn insert(&mut self, value: u32) {
        let (min, _) = self.kind.bounds();
        self.values[(value - min) as usize] = true;
    }

    fn parse_item(&mut self, item: &str, expression: &str) -> Result<()> {
        let kind = self.kind;
        let err = |reason: String| OpsError::cron(expression, reason);
        if item.is_empty() {
            return Err(err(format!("empty item in {} field", kind.name())));
        }
        let upper = item.to_ascii_uppercase();

        // Calendar modifiers first; they never combine with ranges or steps.
        if kind == FieldKind::DayOfMonth {
            if upper == "L" {
                self.calendar.push(CalendarItem::LastDay);
                return Ok(());
            }
            if let Some(day) = upper.strip_suffix('W') {
                let day = self.parse_single(day, expression)?;
                self.calendar.push(CalendarItem::NearestWeekday(day));
                return Ok(());
            }
        }
        if kind == FieldKind::DayOfWeek {
            if upper == "L" {
                self.insert(6);
                return Ok(());
            }
            if let Some((weekday, nth)) = item.split_once('#') {
                let weekday = self.parse_single(weekday, expression)?;
                let nth: u32 = nth
                    .parse()
                    .map_err(|_| err(format!("invalid occurrence '{nth}' in '{item}'")))?;
                if !(1..=5).contains(&nth) {
                    return Err(err(format!("occurrence must be 1-5 in '{item}'")));
                }
                self.calendar.push(CalendarItem::NthWeekday { weekday, nth });
                return Ok(());
            }
            if upper.len() > 1 && upper.ends_with('L') {
                let weekday = self.parse_single(&item[..item.len() - 1], expression)?;
                self.calendar.push(CalendarItem::LastWeekday(weekday));
                return Ok(());
            }
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| err(format!("invalid step '{step}' in '{item}'")))?;
                if step == 0 {
                    return Err(err(format!("step must be positive in '{item}'")));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (min, max) = kind.bounds();
        let (start, end) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = split_range(range) {
            (
                self.parse_single(a, expression)?,
                self.parse_single(b, expression)?,
            )
        } else {
            let start = self.parse_single(range, expression)?;
            match step {
                Some(_) => (start, max),
                None => {
                    // `$` in day-of-month tracks the real month length.
                    if kind == FieldKind::DayOfMonth && range == "$" {
                        self.calendar.push(CalendarItem::LastDay);
                    } else {
                        self.insert(start);
                    }
                    return Ok(());
                }
            }
        };

        if start > end && !kind.wraps() {
            return Err(err(format!(
                "range '{range}' runs backwards in {} field",
                kind.name()
            )));
        }

        let size = max - min + 1;
        let distance = (end + size - start) % size;
        let step = step.unwrap_or(1) as usize;
        for offset in (0..=distance).step_by(step) {
            let value = min + (start - min + offset) % size;
            self.insert(value);
        }
        Ok(())
    }

    /// A single value: a number, a name, `^` (first) or `$` (last).
    fn parse_single(&self, text: &str, expression: &str) -> Result<u32> {
        let kind = self.kind;
        let (min, max) = kind.bounds();
        let text = text.trim();
        let lower = text.to_ascii_lowercase();

        let value = match lower.as_str() {
            "^" => Some(min),
            "$" => Some(max),
            _ => None,
        };
        let value = value.or_else(|| match kind {
            FieldKind::Month => MONTH_NAMES
                .iter()
                .position(|n| *n == lower)
                .map(|i| i as u32 + 1),
            FieldKind::DayOfWeek => WEEKDAY_NAMES
                .iter()
                .position(|n| *n == lower)
                .map(|i| i as u32),
            FieldKind::Hour => parse_meridiem(&lower),
            _ => None,
        });
        let value = match value {
            Some(v) => v,
            None => lower.parse::<u32>().map_err(|_| {
                OpsError::cron(
                    expression,
                    format!("'{text}' is not a valid {} value", kind.name()),
                )
            })?,
        };

        if value < min || value > max {
            return Err(OpsError::cron(
                expression,
                format!(
                    "{} value {value} outside {min}-{max}",
                    kind.name()
                ),
            ));
        }
        Ok(value)
    }

    /// Bitmask of matching days (bit `d` set for day `d`) for one concrete month.
    pub fn day_mask(&self, year: i32, month: u32) -> u32 {
        let last = days_in_month(year, month);
        let mut mask = 0u32;
        match self.kind {
            FieldKind::DayOfMonth => {
                for day in 1..=last {
                    if self.contains(day) {
                        mask |= 1 << day;
                    }
                }
                for item in &self.calendar {
                    match *item {
                        CalendarItem::LastDay => mask |= 1 << last,
                        CalendarItem::NearestWeekday(day) => {
                            if let Some(d) = nearest_weekday(year, month, day) {
                                mask |= 1 << d;
                            }
                        }
                        _ => {}
                    }
                }
            }
            FieldKind::DayOfWeek => {
                let first = weekday_of(year, month, 1);
                for day in 1..=last {
                    if self.contains((first + day - 1) % 7) {
                        mask |= 1 << day;
                    }
                }
                for item in &self.calendar {
                    match *item {
                        CalendarItem::LastWeekday(weekday) => {
                            let last_wd = weekday_of(year, month, last);
                            mask |= 1 << (last - (last_wd + 7 - weekday) % 7);
                        }
                        CalendarItem::NthWeekday { weekday, nth } => {
                            let day = 1 + (weekday + 7 - first) % 7 + 7 * (nth - 1);
                            if day <= last {
                                mask |= 1 << day;
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        mask
    }
}

fn split_range(text: &str) -> Option<(&str, &str)> {
    text.split_once('-')
}

fn parse_meridiem(text: &str) -> Option<u32> {
    let (digits, pm) = if let Some(d) = text.strip_suffix("am") {
        (d, false)
    } else if let Some(d) = text.strip_suffix("pm") {
        (d, true)
    } else {
        return None;
    };
    let hour: u32 = digits.trim().parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    Some(match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    })
}

// ---------------------------------------------------------------------------
// Calendar helpers
// ---------------------------------------------------------------------------

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Weekday of a date, Monday = 0.
pub(crate) fn weekday_of(year: i32, month: u32, day: u32) -> u32 {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| d.weekday().num_days_from_monday())
        .unwrap_or(0)
}

fn nearest_weekday(year: i32, month: u32, day: u32) -> Option<u32> {
    let last = days_in_month(year, month);
    if day > last {
        return None;
    }
    Some(match weekday_of(year, month, day) {
        5 if day == 1 => 3,
        5 => day - 1,
        6 if day == last => day - 2,
        6 => day + 1,
        _ => day,
    })
}
