//! Job schedule specifications.
//!
//! A schedule spec is the human-written string stored in `scheduled_jobs.schedule_spec`:
//!
//! | Spec                      | Meaning                                   |
//! |---------------------------|-------------------------------------------|
//! | `every 30s`               | recurring, 30 seconds after each finish   |
//! | `every 5 minutes`         | recurring, unit words are accepted        |
//! | `daily at 03:30`          | once per day at the given UTC time        |
//! | `once`                    | runs a single time after registration     |
//!
//! Interval units: `ms`, `s`, `m`, `h`, `d` and their long forms.

use chrono::{DateTime, Days, NaiveTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors from schedule parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The spec does not match any supported form.
    #[error("Unrecognized schedule spec '{0}'")]
    Unrecognized(String),

    /// The interval is zero.
    #[error("Schedule interval must be greater than zero: '{0}'")]
    ZeroInterval(String),

    /// Unknown interval unit.
    #[error("Unknown interval unit '{unit}' in '{spec}'")]
    UnknownUnit {
        /// The offending unit
        unit: String,
        /// The full spec
        spec: String,
    },
}

/// When a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Recurring at a fixed interval measured from the end of the previous run
    Every(Duration),
    /// Every day at a fixed UTC time
    DailyAt(NaiveTime),
    /// A single run
    Once,
}

impl Schedule {
    /// First due time for a job registered at `now`.
    ///
    /// Interval and one-off jobs are due immediately; daily jobs wait for their slot.
    #[must_use]
    pub fn first_run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(_) | Self::Once => Some(now),
            Self::DailyAt(time) => Some(next_daily(*time, now)),
        }
    }

    /// Next due time after a run that finished at `finished_at`.
    ///
    /// Returns `None` when the job should not run again.
    #[must_use]
    pub fn next_run_after(&self, finished_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|interval| finished_at.checked_add_signed(interval)),
            Self::DailyAt(time) => Some(next_daily(*time, finished_at)),
            Self::Once => None,
        }
    }
}

/// Next occurrence of `time` strictly after `after`.
fn next_daily(time: NaiveTime, after: DateTime<Utc>) -> DateTime<Utc> {
    let today = after.date_naive().and_time(time).and_utc();
    if today > after {
        today
    } else {
        after
            .date_naive()
            .checked_add_days(Days::new(1))
            .map_or(today, |tomorrow| tomorrow.and_time(time).and_utc())
    }
}

fn unit_duration(value: u64, unit: &str, spec: &str) -> Result<Duration, ScheduleError> {
    let duration = match unit {
        "ms" | "millis" | "millisecond" | "milliseconds" => Duration::from_millis(value),
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(value),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs(value.saturating_mul(60)),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs(value.saturating_mul(3600)),
        "d" | "day" | "days" => Duration::from_secs(value.saturating_mul(86_400)),
        other => {
            return Err(ScheduleError::UnknownUnit {
                unit: other.to_string(),
                spec: spec.to_string(),
            });
        }
    };
    Ok(duration)
}

fn parse_interval(body: &str, spec: &str) -> Result<Duration, ScheduleError> {
    let body = body.trim();
    let split = body
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ScheduleError::Unrecognized(spec.to_string()))?;
    let (digits, unit) = body.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ScheduleError::Unrecognized(spec.to_string()))?;
    let duration = unit_duration(value, unit.trim(), spec)?;
    if duration.is_zero() {
        return Err(ScheduleError::ZeroInterval(spec.to_string()));
    }
    Ok(duration)
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim().to_ascii_lowercase();

        if spec == "once" {
            return Ok(Self::Once);
        }
        if let Some(body) = spec.strip_prefix("every ") {
            return parse_interval(body, s).map(Self::Every);
        }
        if let Some(time) = spec.strip_prefix("daily at ") {
            return NaiveTime::parse_from_str(time.trim(), "%H:%M")
                .map(Self::DailyAt)
                .map_err(|_| ScheduleError::Unrecognized(s.to_string()));
        }
        Err(ScheduleError::Unrecognized(s.to_string()))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(interval) => {
                let millis = interval.as_millis();
                if millis % 1000 != 0 {
                    write!(f, "every {millis}ms")
                } else if millis % 3_600_000 == 0 {
                    write!(f, "every {}h", millis / 3_600_000)
                } else if millis % 60_000 == 0 {
                    write!(f, "every {}m", millis / 60_000)
                } else {
                    write!(f, "every {}s", millis / 1000)
                }
            }
            Self::DailyAt(time) => write!(f, "daily at {}", time.format("%H:%M")),
            Self::Once => write!(f, "once"),
        }
    }
}
