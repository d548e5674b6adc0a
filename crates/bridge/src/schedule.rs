//! Cron schedule bookkeeping for scheduled bridges.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use thiserror::Error;

use ysfr_core::{LocalDuration, LocalTime};

/// How far back the missed-window search looks, on top of the session
/// duration. Cross-midnight windows stay visible because the duration is
/// added to this.
pub const MISSED_WINDOW_LOOKBACK: Duration = Duration::from_secs(2 * 3600);

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("cron expression must have 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid cron expression: {0}")]
    Parse(String),
}

/// Parse a cron expression, accepting both the 5-field (minute
/// granularity) and 6-field (second granularity) forms.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let normalized = match trimmed.split_whitespace().count() {
        // Minute granularity: prepend a seconds field.
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_owned(),
        n => return Err(ScheduleError::FieldCount(n)),
    };
    Schedule::from_str(&normalized).map_err(|err| ScheduleError::Parse(err.to_string()))
}

/// The first scheduled instant strictly after `now`.
pub fn next_occurrence(schedule: &Schedule, now: LocalTime) -> Option<LocalTime> {
    schedule.after(&to_datetime(now)).next().map(from_datetime)
}

/// The most recent scheduled instant at or before `now`, searching no
/// further back than `lookback`.
pub fn previous_occurrence(
    schedule: &Schedule,
    now: LocalTime,
    lookback: Duration,
) -> Option<LocalTime> {
    let start = to_datetime(now - LocalDuration::from(lookback));
    let now_dt = to_datetime(now);

    let mut last = None;
    for instant in schedule.after(&start) {
        if instant > now_dt {
            break;
        }
        last = Some(instant);
    }
    last.map(from_datetime)
}

fn to_datetime(time: LocalTime) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(time.as_millis() as i64)
        .single()
        .expect("local time is always a valid timestamp")
}

fn from_datetime(time: DateTime<Utc>) -> LocalTime {
    LocalTime::from_millis(time.timestamp_millis() as u64)
}

/// Per-scheduled-bridge bookkeeping for the cron loop and the
/// missed-schedule sweeper.
#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub schedule: Schedule,
    pub duration: Duration,
    pub last_execution: Option<LocalTime>,
    pub next_execution: Option<LocalTime>,
    pub missed_windows: u64,
}

impl ScheduleRecord {
    pub fn new(expr: &str, duration: Duration) -> Result<Self, ScheduleError> {
        Ok(Self {
            schedule: parse_schedule(expr)?,
            duration,
            last_execution: None,
            next_execution: None,
            missed_windows: 0,
        })
    }

    /// Recompute and store the next execution after `now`.
    pub fn compute_next(&mut self, now: LocalTime) {
        self.next_execution = next_occurrence(&self.schedule, now);
    }

    /// Whether `now` lies within a scheduled window: the most recent
    /// scheduled instant plus the session duration. Returns the window
    /// bounds.
    pub fn current_window(&self, now: LocalTime) -> Option<(LocalTime, LocalTime)> {
        let lookback = MISSED_WINDOW_LOOKBACK + self.duration;
        let start = previous_occurrence(&self.schedule, now, lookback)?;
        let end = start + self.duration.into();
        (now < end).then_some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-15 00:00:00 UTC, a Monday.
    const MONDAY_MIDNIGHT: u64 = 1_705_276_800;

    fn at(secs_past: u64) -> LocalTime {
        LocalTime::from_secs(MONDAY_MIDNIGHT + secs_past)
    }

    #[test]
    fn five_field_expression_is_normalized() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        // 00:02:30 → next firing at 00:05:00.
        let next = next_occurrence(&schedule, at(150)).unwrap();
        assert_eq!(next, at(300));
    }

    #[test]
    fn six_field_expression_fires_on_seconds() {
        let schedule = parse_schedule("* * * * * *").unwrap();
        let next = next_occurrence(&schedule, at(10)).unwrap();
        assert_eq!(next, at(11));
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(matches!(
            parse_schedule("* * *"),
            Err(ScheduleError::FieldCount(3))
        ));
        assert!(parse_schedule("not a cron line expression x").is_err());
    }

    #[test]
    fn previous_occurrence_finds_the_latest_instant() {
        // Hourly at minute 0.
        let schedule = parse_schedule("0 * * * *").unwrap();
        let prev = previous_occurrence(&schedule, at(3 * 3600 + 1200), MISSED_WINDOW_LOOKBACK);
        assert_eq!(prev, Some(at(3 * 3600)));
    }

    #[test]
    fn current_window_contains_now() {
        // Daily at 23:30, one-hour session: crosses midnight.
        let record = ScheduleRecord::new("30 23 * * *", Duration::from_secs(3600)).unwrap();

        // 00:10 Monday is inside Sunday's 23:30 window.
        let now = at(600);
        let (start, end) = record.current_window(now).unwrap();
        assert_eq!(start, LocalTime::from_secs(MONDAY_MIDNIGHT - 1800));
        assert_eq!(end, at(1800));

        // 01:00 Monday is past the window.
        assert!(record.current_window(at(3600)).is_none());
    }

    #[test]
    fn window_for_every_second_schedule_always_contains_now() {
        let record = ScheduleRecord::new("* * * * * *", Duration::from_secs(3)).unwrap();
        let now = at(900);
        let (start, end) = record.current_window(now).unwrap();
        assert!(start <= now && now < end);
    }
}
