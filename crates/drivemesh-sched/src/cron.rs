//! 5-field cron expressions
//!
//! Grammar per field: `*`, `?` (alias for `*`), comma lists, `a-b` ranges,
//! `*/step`, and `a-b/step`. Month accepts `jan..dec`, day-of-week accepts
//! `sun..sat` plus `7` as an alias for Sunday. Out-of-range numeric values
//! clamp to the field bounds; descending ranges and zero steps are errors.
//!
//! Day matching follows standard cron OR semantics: with both day-of-month
//! and day-of-week restricted, a day matches when either does.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use drivemesh_core::domain::{EngineError, EngineResult};

/// Search horizon for the next occurrence: one year of minutes.
const HORIZON_MINUTES: i64 = 366 * 24 * 60;

const MONTH_ALIASES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DOW_ALIASES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn empty() -> Self {
        FieldSet(0)
    }

    fn insert(&mut self, value: u8) {
        self.0 |= 1 << value;
    }

    fn contains(&self, value: u8) -> bool {
        self.0 & (1 << value) != 0
    }

    fn full(min: u8, max: u8) -> Self {
        let mut set = FieldSet::empty();
        for v in min..=max {
            set.insert(v);
        }
        set
    }

    fn values(&self, min: u8, max: u8) -> Vec<u8> {
        (min..=max).filter(|v| self.contains(*v)).collect()
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
    /// Whether day-of-month was written as anything but a wildcard.
    dom_restricted: bool,
    /// Whether day-of-week was written as anything but a wildcard.
    dow_restricted: bool,
}

impl CronExpr {
    /// Parses a 5-field expression: minute, hour, day-of-month, month,
    /// day-of-week.
    pub fn parse(expr: &str) -> EngineResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::InvalidCron(format!(
                "expected 5 fields, got {} in '{expr}'",
                fields.len()
            )));
        }

        let minute = parse_field(fields[0], 0, 59, &NO_ALIASES, false)?;
        let hour = parse_field(fields[1], 0, 23, &NO_ALIASES, false)?;
        let day_of_month = parse_field(fields[2], 1, 31, &NO_ALIASES, false)?;
        let month = parse_field(fields[3], 1, 12, &MONTH_ALIASES, false)?;
        let day_of_week = parse_field(fields[4], 0, 6, &DOW_ALIASES, true)?;

        Ok(Self {
            minute: minute.0,
            hour: hour.0,
            day_of_month: day_of_month.0,
            month: month.0,
            day_of_week: day_of_week.0,
            dom_restricted: day_of_month.1,
            dow_restricted: day_of_week.1,
        })
    }

    /// Whether the instant's minute matches all five fields.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minute.contains(at.minute() as u8)
            || !self.hour.contains(at.hour() as u8)
            || !self.month.contains(at.month() as u8)
        {
            return false;
        }
        self.day_matches(at)
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom_hit = self.day_of_month.contains(at.day() as u8);
        let dow_hit = self
            .day_of_week
            .contains(at.weekday().num_days_from_sunday() as u8);
        match (self.dom_restricted, self.dow_restricted) {
            (false, false) => true,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            // Standard cron OR semantics when both are restricted.
            (true, true) => dom_hit || dow_hit,
        }
    }

    /// First matching instant strictly after `from`, or `None` when the
    /// one-year horizon is exceeded.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(from) + Duration::minutes(1);
        let deadline = t + Duration::minutes(HORIZON_MINUTES);

        while t < deadline {
            if !self.month.contains(t.month() as u8) {
                t = first_minute_of_next_month(t);
                continue;
            }
            if !self.day_matches(t) {
                t = first_minute_of_next_day(t);
                continue;
            }
            if !self.hour.contains(t.hour() as u8) {
                t = first_minute_of_next_hour(t);
                continue;
            }
            if self.minute.contains(t.minute() as u8) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }
}

impl std::fmt::Display for CronExpr {
    /// Normalized form: alias-free, clamped, with runs compressed to ranges.
    /// Parsing the output reproduces the same expression.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            field_to_string(&self.minute, 0, 59),
            field_to_string(&self.hour, 0, 23),
            if self.dom_restricted {
                field_to_string(&self.day_of_month, 1, 31)
            } else {
                "*".to_string()
            },
            field_to_string(&self.month, 1, 12),
            if self.dow_restricted {
                field_to_string(&self.day_of_week, 0, 6)
            } else {
                "*".to_string()
            },
        )
    }
}

const NO_ALIASES: [&str; 0] = [];

/// Parses one field, returning the value set and whether it was restricted
/// (anything other than `*`/`?`).
fn parse_field<const N: usize>(
    field: &str,
    min: u8,
    max: u8,
    aliases: &[&str; N],
    seven_is_zero: bool,
) -> EngineResult<(FieldSet, bool)> {
    if field == "*" || field == "?" {
        return Ok((FieldSet::full(min, max), false));
    }

    let mut set = FieldSet::empty();
    for term in field.split(',') {
        if term.is_empty() {
            return Err(EngineError::InvalidCron(format!("empty term in '{field}'")));
        }

        let (range_part, step) = match term.split_once('/') {
            Some((range, step_str)) => {
                let step: u8 = step_str.parse().map_err(|_| {
                    EngineError::InvalidCron(format!("invalid step '{step_str}'"))
                })?;
                if step == 0 {
                    return Err(EngineError::InvalidCron(format!(
                        "step must be greater than 0 in '{term}'"
                    )));
                }
                (range, step)
            }
            None => (term, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a = parse_value(a, min, max, aliases, seven_is_zero)?;
            let b = parse_value(b, min, max, aliases, seven_is_zero)?;
            if a > b {
                return Err(EngineError::InvalidCron(format!(
                    "descending range '{range_part}'"
                )));
            }
            (a, b)
        } else {
            let v = parse_value(range_part, min, max, aliases, seven_is_zero)?;
            if term.contains('/') {
                return Err(EngineError::InvalidCron(format!(
                    "step requires a range or '*' in '{term}'"
                )));
            }
            (v, v)
        };

        let mut v = lo;
        while v <= hi {
            set.insert(v);
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }

    Ok((set, true))
}

/// Parses one value: a named alias or a number clamped to the field bounds.
fn parse_value<const N: usize>(
    raw: &str,
    min: u8,
    max: u8,
    aliases: &[&str; N],
    seven_is_zero: bool,
) -> EngineResult<u8> {
    let lowered = raw.to_ascii_lowercase();
    if let Some(idx) = aliases.iter().position(|a| *a == lowered) {
        return Ok(min + idx as u8);
    }
    let n: i64 = raw
        .parse()
        .map_err(|_| EngineError::InvalidCron(format!("invalid value '{raw}'")))?;
    if seven_is_zero && n == 7 {
        return Ok(0);
    }
    Ok(n.clamp(min as i64, max as i64) as u8)
}

/// Renders a field as `*` or a comma list with consecutive runs compressed
/// to `a-b` ranges.
fn field_to_string(set: &FieldSet, min: u8, max: u8) -> String {
    if *set == FieldSet::full(min, max) {
        return "*".to_string();
    }
    let values = set.values(min, max);
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let start = values[i];
        let mut end = start;
        while i + 1 < values.len() && values[i + 1] == end + 1 {
            end = values[i + 1];
            i += 1;
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
        i += 1;
    }
    parts.join(",")
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
        .single()
        .expect("valid truncated timestamp")
}

fn first_minute_of_next_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t) + Duration::minutes(60 - t.minute() as i64)
}

fn first_minute_of_next_day(t: DateTime<Utc>) -> DateTime<Utc> {
    let day_start = Utc
        .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .expect("valid day start");
    day_start + Duration::days(1)
}

fn first_minute_of_next_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("valid month start")
}
