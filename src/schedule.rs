/// Loop deadlines: when a worker loop is next expected to bump its counter.
///
/// Scheduled loops carry a 5-field cron expression (`m h dom mon dow`),
/// periodic loops a period in seconds. Cron is evaluated in UTC.
use crate::clock::seconds;
use crate::sample::{LoopSnapshot, LoopType};
use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

/// Parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let trimmed = raw.trim();
        let expanded = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::new(trimmed, "expected 5 fields"));
        }

        let minutes = parse_field(trimmed, parts[0], 0, 59)?;
        let hours = parse_field(trimmed, parts[1], 0, 23)?;
        let days_of_month = parse_field(trimmed, parts[2], 1, 31)?;
        let months = parse_field(trimmed, parts[3], 1, 12)?;
        let mut days_of_week = parse_field(trimmed, parts[4], 0, 7)?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week |= 1;
        }

        Ok(Self {
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: (days_of_week & 0x7f) as u8,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    /// First matching minute strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = now.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        let limit = now + Duration::days(366 * 5);

        while candidate <= limit {
            if !self.day_matches(candidate) {
                candidate = next_midnight(candidate)?;
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                candidate = candidate.duration_trunc(Duration::hours(1)).ok()? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        if self.months & (1 << at.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << at.day()) != 0;
        let dow = self.days_of_week & (1 << at.weekday().num_days_from_sunday()) != 0;
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

fn next_midnight(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date = at.date_naive().succ_opt()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn parse_field(raw: &str, field: &str, min: u32, max: u32) -> Result<u64, ScheduleError> {
    let mut mask = 0u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| ScheduleError::new(raw, format!("invalid step in '{item}'")))?;
                if step == 0 {
                    return Err(ScheduleError::new(raw, format!("zero step in '{item}'")));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(raw, lo, min, max)?, parse_value(raw, hi, min, max)?)
        } else {
            let value = parse_value(raw, range, min, max)?;
            // `5/15` means "from 5 to the end, every 15"
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(ScheduleError::new(raw, format!("empty range '{range}'")));
        }
        for value in (start..=end).step_by(step as usize) {
            mask |= 1 << value;
        }
    }
    Ok(mask)
}

fn parse_value(raw: &str, value: &str, min: u32, max: u32) -> Result<u32, ScheduleError> {
    let parsed: u32 = value
        .parse()
        .map_err(|_| ScheduleError::new(raw, format!("invalid value '{value}'")))?;
    if parsed < min || parsed > max {
        return Err(ScheduleError::new(
            raw,
            format!("value {parsed} out of range ({min}-{max})"),
        ));
    }
    Ok(parsed)
}

/// Next trigger time of a cron expression after `now`.
pub fn next_occurrence(schedule: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    CronSchedule::parse(schedule)?
        .next_after(now)
        .ok_or_else(|| ScheduleError::new(schedule, "no occurrence within 5 years"))
}

/// Deadline by which a loop's counter is expected to change, if it has one.
///
/// Scheduled loops use their cron expression, periodic loops `now + period`.
/// Other loop types, loops missing their schedule/period, and periods that are
/// negative or not representable have no deadline and are never reported as
/// stale.
pub fn loop_deadline(snapshot: &LoopSnapshot, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match snapshot.loop_type {
        LoopType::Scheduled | LoopType::ScheduledProducer => {
            let schedule = snapshot.schedule.as_deref().filter(|s| !s.is_empty())?;
            match next_occurrence(schedule, now) {
                Ok(at) => Some(at),
                Err(e) => {
                    tracing::debug!(error = %e, "cannot compute loop deadline");
                    None
                }
            }
        }
        LoopType::Periodic => {
            let period = snapshot.period?;
            let deadline = seconds(period).and_then(|p| now.checked_add_signed(p));
            if deadline.is_none() {
                tracing::debug!(period, "loop period out of range, no deadline");
            }
            deadline
        }
        LoopType::Other => None,
    }
}

/// An unparsable or unsatisfiable cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleError {
    pub schedule: String,
    pub reason: String,
}

impl ScheduleError {
    fn new(schedule: &str, reason: impl Into<String>) -> Self {
        Self {
            schedule: schedule.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid schedule '{}': {}", self.schedule, self.reason)
    }
}

impl std::error::Error for ScheduleError {}
