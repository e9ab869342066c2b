//! Schedule expressions and the "next activation" oracle.
//!
//! Accepted forms:
//! - 6/7-field cron, seconds first: `0 */5 * * * *`
//! - 5-field cron, seconds implied as 0: `*/5 * * * *`
//! - shorthands: `@yearly @annually @monthly @weekly @daily @midnight @hourly`
//! - fixed interval: `@every 1h30m` (units `ms s m h d`)

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::SchedulerError;

/// Produces the next activation instant. `None` means the schedule has no
/// defined next point and must be polled again later.
pub trait ScheduleOracle: Send + Sync {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub enum CronSchedule {
    Cron {
        expr: String,
        schedule: cron::Schedule,
    },
    Every {
        expr: String,
        interval: Duration,
    },
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let trimmed = expr.trim();
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            expr: expr.to_string(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("expression is empty".into()));
        }

        if let Some(interval) = trimmed.strip_prefix("@every") {
            let interval = parse_interval(interval.trim()).map_err(invalid)?;
            return Ok(CronSchedule::Every {
                expr: trimmed.to_string(),
                interval,
            });
        }

        let normalized = if trimmed.starts_with('@') {
            expand_shorthand(trimmed)
                .ok_or_else(|| invalid(format!("unknown shorthand '{trimmed}'")))?
                .to_string()
        } else {
            match trimmed.split_whitespace().count() {
                5 => format!("0 {trimmed}"),
                6 | 7 => trimmed.to_string(),
                n => {
                    return Err(invalid(format!(
                        "expected 5, 6 or 7 fields, got {n}"
                    )));
                }
            }
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(CronSchedule::Cron {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        match self {
            CronSchedule::Cron { expr, .. } | CronSchedule::Every { expr, .. } => expr,
        }
    }

    /// The next `count` activations after `from`, stopping early if the
    /// schedule runs out.
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = from;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

impl ScheduleOracle for CronSchedule {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSchedule::Cron { schedule, .. } => schedule.after(&now).next(),
            CronSchedule::Every { interval, .. } => now.checked_add_signed(*interval),
        }
    }
}

fn expand_shorthand(expr: &str) -> Option<&'static str> {
    match expr {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * Sun"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

/// Parses `1h30m`, `45s`, `500ms`, `2d`.
fn parse_interval(input: &str) -> Result<Duration, String> {
    if input.is_empty() {
        return Err("@every needs a duration, e.g. '@every 30m'".into());
    }

    let mut total = Duration::zero();
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number at '{rest}'"));
        }
        let value: i64 = rest[..digits]
            .parse()
            .map_err(|e| format!("bad number in '{input}': {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::try_milliseconds(value),
            "s" => Duration::try_seconds(value),
            "m" => Duration::try_minutes(value),
            "h" => Duration::try_hours(value),
            "d" => Duration::try_days(value),
            "" => return Err(format!("missing unit after {value} in '{input}'")),
            other => return Err(format!("unknown unit '{other}' in '{input}'")),
        };
        total = part
            .and_then(|p| total.checked_add(&p))
            .ok_or_else(|| format!("interval '{input}' is out of range"))?;
        rest = &rest[unit_len..];
    }

    if total <= Duration::zero() {
        return Err(format!("interval '{input}' must be positive"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, h, m, 0).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let s = CronSchedule::parse("0 0 * * * *").unwrap();
        let next = s.next_after(at(10, 30)).unwrap();
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_five_field_form() {
        let s = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = s.next_after(at(10, 2)).unwrap();
        assert_eq!(next.minute(), 15);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_shorthands() {
        for expr in ["@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly"] {
            let s = CronSchedule::parse(expr).unwrap();
            assert!(s.next_after(at(7, 0)).is_some(), "{expr}");
        }
        let daily = CronSchedule::parse("@daily").unwrap();
        let next = daily.next_after(at(7, 0)).unwrap();
        assert_eq!((next.hour(), next.minute()), (0, 0));
        assert!(next > at(7, 0));
    }

    #[test]
    fn test_interval_form() {
        let s = CronSchedule::parse("@every 1h30m").unwrap();
        assert_eq!(s.next_after(at(10, 0)).unwrap(), at(11, 30));
        let s = CronSchedule::parse("@every 500ms").unwrap();
        assert_eq!(s.next_after(at(10, 0)).unwrap(), at(10, 0) + Duration::milliseconds(500));
    }

    #[test]
    fn test_exhausted_schedule_is_indefinite() {
        let s = CronSchedule::parse("0 0 0 1 1 * 2020").unwrap();
        assert!(s.next_after(at(10, 0)).is_none());
        assert!(s.upcoming(at(10, 0), 3).is_empty());
    }

    #[test]
    fn test_upcoming() {
        let s = CronSchedule::parse("@hourly").unwrap();
        let next = s.upcoming(at(10, 30), 3);
        assert_eq!(next, vec![at(11, 0), at(12, 0), at(13, 0)]);
    }

    #[test]
    fn test_malformed_expressions() {
        for expr in [
            "",
            "   ",
            "bad",
            "* * *",
            "61 * * * * *",
            "@fortnightly",
            "@every",
            "@every 0s",
            "@every 10",
            "@every 5w",
            "@every m",
        ] {
            let err = CronSchedule::parse(expr).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidSchedule { .. }),
                "{expr:?} should be rejected"
            );
        }
    }
}
