//! Five-field cron expressions evaluated in UTC
//!
//! Expressions use the classic `minute hour day-of-month month day-of-week`
//! layout with day-of-week `0`-`7` (both `0` and `7` are Sunday). They are
//! translated to the seconds-first form the `cron` crate parses, with
//! numeric weekdays rewritten as names.
//!
//! When both day-of-month and day-of-week are restricted a day matches if
//! either field does, as in classic cron. The `cron` crate requires both, so
//! such expressions keep one schedule per field and fire at the earlier of
//! the two.

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let schedules = translate(expression)?
            .iter()
            .map(|translated| Schedule::from_str(translated).map_err(|e| invalid(expression, e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedules,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

fn invalid(expression: &str, reason: impl fmt::Display) -> ReplicationError {
    ReplicationError::InvalidSchedule(format!("'{}': {}", expression, reason))
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn translate(expression: &str) -> Result<Vec<String>> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(
            expression,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let weekday = translate_weekdays(expression, fields[4])?;
    let render = |day: &str, weekday: &str| {
        format!("0 {} {} {} {} {}", fields[0], fields[1], day, fields[3], weekday)
    };
    if is_restricted(fields[2]) && is_restricted(fields[4]) {
        Ok(vec![render(fields[2], "*"), render("*", &weekday)])
    } else {
        Ok(vec![render(fields[2], &weekday)])
    }
}

fn weekday_name(expression: &str, token: &str) -> Result<&'static str> {
    let day: usize = token
        .parse()
        .map_err(|_| invalid(expression, format!("bad day of week '{}'", token)))?;
    WEEKDAYS
        .get(day)
        .copied()
        .ok_or_else(|| invalid(expression, format!("day of week {} out of range", day)))
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

fn translate_weekdays(expression: &str, field: &str) -> Result<String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };

        let translated = match range.split_once('-') {
            Some((start, end)) if is_numeric(start) && is_numeric(end) => {
                let first = weekday_name(expression, start)?;
                // A range ending on the second Sunday wraps past Saturday
                if end == "7" && start != "0" && start != "7" {
                    if step.is_some() {
                        return Err(invalid(
                            expression,
                            format!("stepped range '{}' ending on 7", item),
                        ));
                    }
                    items.push(format!("{}-SAT", first));
                    items.push("SUN".to_string());
                    continue;
                }
                if (start == "0" || start == "7") && end == "7" {
                    "*".to_string()
                } else {
                    format!("{}-{}", first, weekday_name(expression, end)?)
                }
            }
            None if is_numeric(range) => weekday_name(expression, range)?.to_string(),
            _ => range.to_string(),
        };

        items.push(match step {
            Some(step) => format!("{}/{}", translated, step),
            None => translated,
        });
    }
    Ok(items.join(","))
}
