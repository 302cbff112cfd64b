use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{Result, SchedulerError};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Bit `n` set means value `n` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.0 & (1u64 << value) != 0
    }
}

/// Inclusive bounds and optional names for one cron field.
struct FieldSpec {
    label: &'static str,
    min: u32,
    max: u32,
    /// Name for value `names_from + i`.
    names: &'static [&'static str],
    names_from: u32,
}

const MINUTE: FieldSpec = FieldSpec { label: "minute", min: 0, max: 59, names: &[], names_from: 0 };
const HOUR: FieldSpec = FieldSpec { label: "hour", min: 0, max: 23, names: &[], names_from: 0 };
const DAY_OF_MONTH: FieldSpec =
    FieldSpec { label: "day-of-month", min: 1, max: 31, names: &[], names_from: 0 };
const MONTH: FieldSpec =
    FieldSpec { label: "month", min: 1, max: 12, names: &MONTH_NAMES, names_from: 1 };
// 7 is accepted as a second spelling of Sunday and folded onto 0
const DAY_OF_WEEK: FieldSpec =
    FieldSpec { label: "day-of-week", min: 0, max: 7, names: &DAY_NAMES, names_from: 0 };

/// A parsed five-field cron expression
/// (`minute hour day-of-month month day-of-week`), evaluated in UTC at
/// minute resolution.
///
/// When both day fields are restricted a day matches if *either* matches,
/// as in Vixie cron. A field starting with `*` counts as unrestricted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    day_of_month_star: bool,
    day_of_week_star: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(format!("unsupported macro `{other}`")));
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK).map_err(invalid)?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 & !(1 << 7)) | 1);
        }

        Ok(Self {
            expression: trimmed.to_string(),
            minutes: parse_field(fields[0], &MINUTE).map_err(invalid)?,
            hours: parse_field(fields[1], &HOUR).map_err(invalid)?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH).map_err(invalid)?,
            months: parse_field(fields[3], &MONTH).map_err(invalid)?,
            days_of_week,
            day_of_month_star: fields[2].starts_with('*'),
            day_of_week_star: fields[4].starts_with('*'),
        })
    }

    /// True when the minute containing `at` matches. Seconds are ignored.
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        if !self.minutes.contains(at.minute())
            || !self.hours.contains(at.hour())
            || !self.months.contains(at.month())
        {
            return false;
        }

        let dom = self.days_of_month.contains(at.day());
        let dow = self.days_of_week.contains(at.weekday().num_days_from_sunday());
        if self.day_of_month_star || self.day_of_week_star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

impl FromStr for CronExpr {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        CronExpr::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expression)
    }
}

fn parse_field(field: &str, spec: &FieldSpec) -> std::result::Result<FieldSet, String> {
    let mut set = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("{}: invalid step `{step}`", spec.label))?;
                if step == 0 {
                    return Err(format!("{}: step must be at least 1", spec.label));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `5/15` means "from 5 to the end, every 15"
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(format!("{}: range `{range}` is reversed", spec.label));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            set |= 1u64 << value;
        }
    }
    Ok(FieldSet(set))
}

fn parse_value(token: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let lower = token.to_ascii_lowercase();
    if let Some(pos) = spec.names.iter().position(|name| *name == lower) {
        return Ok(spec.names_from + pos as u32);
    }
    let value: u32 = token
        .parse()
        .map_err(|_| format!("{}: invalid value `{token}`", spec.label))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{}: {value} is outside {}-{}",
            spec.label, spec.min, spec.max
        ));
    }
    Ok(value)
}
