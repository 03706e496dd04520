//! Five-field cron expressions (UTC) and the background loops that fire jobs.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::config::CronConfig;
use crate::services::dunning::{CronJob, DunningRunner};
use crate::services::fees::first_of_next_month;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {0}")]
    FieldCount(usize),
    #[error("invalid {field} field `{value}`")]
    Invalid { field: &'static str, value: String },
    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// Allowed values of one field as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// `false` when the field starts with `*`.
    restricted: bool,
}

impl Field {
    fn has(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

fn parse_number(field: &'static str, raw: &str, min: u32, max: u32) -> Result<u32, CronError> {
    let value: u32 = raw.parse().map_err(|_| CronError::Invalid {
        field,
        value: raw.to_string(),
    })?;
    if value < min || value > max {
        return Err(CronError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn parse_field(field: &'static str, spec: &str, min: u32, max: u32) -> Result<Field, CronError> {
    let invalid = || CronError::Invalid {
        field,
        value: spec.to_string(),
    };
    let mut bits = 0u64;
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_number(field, a, min, max)?, parse_number(field, b, min, max)?)
        } else {
            let a = parse_number(field, range, min, max)?;
            // `5/15` means "from 5, every 15".
            (a, if step.is_some() { max } else { a })
        };
        if start > end {
            return Err(invalid());
        }
        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            bits |= 1u64 << value;
        }
    }
    Ok(Field {
        bits,
        restricted: !spec.starts_with('*'),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    /// 0 = Sunday; 7 is folded onto 0.
    days_of_week: Field,
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields[..] else {
            return Err(CronError::FieldCount(fields.len()));
        };
        let mut days_of_week = parse_field("day-of-week", dow, 0, 7)?;
        if days_of_week.has(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }
        Ok(Self {
            minutes: parse_field("minute", minute, 0, 59)?,
            hours: parse_field("hour", hour, 0, 23)?,
            days_of_month: parse_field("day-of-month", dom, 1, 31)?,
            months: parse_field("month", month, 1, 12)?,
            days_of_week,
        })
    }
}

impl CronSchedule {
    /// Classic cron rule: when both day fields are restricted, either may match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.has(date.day());
        let dow = self.days_of_week.has(date.weekday().num_days_from_sunday());
        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.has(at.minute())
            && self.hours.has(at.hour())
            && self.months.has(at.month())
            && self.day_matches(at.date_naive())
    }

    /// First matching minute strictly after `after`. `None` for expressions
    /// that can never fire, such as February 30th.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t: NaiveDateTime = after
            .naive_utc()
            .with_second(0)?
            .with_nanosecond(0)?
            + Duration::minutes(1);
        let limit = t.year() + 5;
        while t.year() <= limit {
            if !self.months.has(t.month()) {
                t = first_of_next_month(t.date()).and_time(NaiveTime::MIN);
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + Duration::days(1)).and_time(NaiveTime::MIN);
                continue;
            }
            if !self.hours.has(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.has(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t.and_utc());
        }
        None
    }
}

/// What `GET /cron/schedules` reports for one job.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub job: CronJob,
    pub expression: String,
    pub next_run: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub fn describe(config: &CronConfig, now: DateTime<Utc>) -> Vec<ScheduleInfo> {
    CronJob::ALL
        .into_iter()
        .map(|job| {
            let expression = job.expression(config).to_string();
            let (next_run, error) = match expression.parse::<CronSchedule>() {
                Ok(schedule) => (schedule.next_after(now), None),
                Err(e) => (None, Some(e.to_string())),
            };
            ScheduleInfo {
                job,
                expression,
                next_run,
                error,
            }
        })
        .collect()
}

/// Spawns one loop per job. A job whose expression does not parse is logged
/// and left out; the others still run.
pub fn start(runner: Arc<DunningRunner>, config: &CronConfig) {
    if !config.enabled {
        info!("Cron jobs disabled");
        return;
    }
    for job in CronJob::ALL {
        let expression = job.expression(config);
        let schedule = match expression.parse::<CronSchedule>() {
            Ok(s) => s,
            Err(e) => {
                error!(job = job.as_str(), expression, "Invalid cron expression, job not scheduled: {e}");
                continue;
            }
        };
        info!(job = job.as_str(), expression, "Cron job scheduled");
        let runner = runner.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.next_after(now) else {
                    error!(job = job.as_str(), "Cron expression never fires, stopping");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                // Errors are logged by the runner and must not stop the loop.
                let _ = runner.run(job, Utc::now()).await;
            }
        });
    }
}
