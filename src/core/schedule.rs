//! Recurrence rules attached to jobs.
//!
//! A [`JobSchedule`] pairs a job with a cron expression, a timezone and an
//! optional activation window and execution cap. The schedule runner polls
//! [`JobSchedule::should_execute_now`] and calls
//! [`JobSchedule::record_execution`] after each fire.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::cron::{CronError, CronExpression, parse_timezone};
use super::types::{JobId, ScheduleId};

/// Timezone used when none is given.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Errors that can occur when creating or mutating a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Bad cron expression or timezone.
    #[error(transparent)]
    Cron(#[from] CronError),

    /// `start_at` is after `end_at`.
    #[error("invalid execution window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// `max_executions` must be positive.
    #[error("max_executions must be greater than zero")]
    InvalidMaxExecutions,
}

/// Status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Inactive,
    /// Execution cap reached. Terminal.
    Expired,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Inactive => "inactive",
            ScheduleStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options accepted when attaching a schedule to a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleOptions {
    #[serde(alias = "cronExpression")]
    pub cron_expression: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default, alias = "isActive")]
    pub is_active: Option<bool>,
    #[serde(default, alias = "startAt")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "endAt")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "maxExecutions")]
    pub max_executions: Option<u64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

impl ScheduleOptions {
    pub fn new(cron_expression: impl Into<String>) -> Self {
        Self {
            cron_expression: cron_expression.into(),
            ..Default::default()
        }
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = Some(is_active);
        self
    }

    pub fn window(mut self, start_at: Option<DateTime<Utc>>, end_at: Option<DateTime<Utc>>) -> Self {
        self.start_at = start_at;
        self.end_at = end_at;
        self
    }

    pub fn max_executions(mut self, max: u64) -> Self {
        self.max_executions = Some(max);
        self
    }
}

/// A recurrence rule owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub id: ScheduleId,
    pub job_id: JobId,
    pub cron_expression: String,
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub status: ScheduleStatus,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub max_executions: Option<u64>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped by storage on every update.
    #[serde(default)]
    pub version: u64,
}

impl JobSchedule {
    /// Validate `options` and build a schedule for `job_id`.
    ///
    /// The first `next_execution` is the first occurrence at or after
    /// `max(now, start_at)`.
    pub fn new(job_id: JobId, options: ScheduleOptions, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let expression = CronExpression::parse(&options.cron_expression)?;
        let timezone = options
            .timezone
            .map(|tz| tz.trim().to_string())
            .filter(|tz| !tz.is_empty())
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        parse_timezone(&timezone)?;
        validate_window(options.start_at, options.end_at)?;
        if options.max_executions == Some(0) {
            return Err(ScheduleError::InvalidMaxExecutions);
        }

        let mut schedule = Self {
            id: ScheduleId::new(),
            job_id,
            cron_expression: expression.as_str().to_string(),
            timezone,
            start_at: options.start_at,
            end_at: options.end_at,
            is_active: options.is_active.unwrap_or(true),
            status: ScheduleStatus::Active,
            last_execution: None,
            next_execution: None,
            execution_count: 0,
            max_executions: options.max_executions,
            metadata: options.metadata.unwrap_or_default(),
            created_at: now,
            updated_at: now,
            version: 0,
        };

        if schedule.end_at.is_some_and(|end| end < now) {
            schedule.deactivate(now);
        } else {
            schedule.next_execution = schedule.first_occurrence(now)?;
        }
        Ok(schedule)
    }

    /// Parsed cron expression.
    pub fn expression(&self) -> Result<CronExpression, ScheduleError> {
        Ok(CronExpression::parse(&self.cron_expression)?)
    }

    /// Parsed timezone.
    pub fn tz(&self) -> Result<Tz, ScheduleError> {
        Ok(parse_timezone(&self.timezone)?)
    }

    /// Whether the schedule may fire at `now`.
    pub fn is_schedule_active(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.status == ScheduleStatus::Active
            && self.start_at.is_none_or(|start| now >= start)
            && self.end_at.is_none_or(|end| now <= end)
            && !self.cap_reached()
    }

    /// Whether the schedule is active and its next occurrence is due.
    pub fn should_execute_now(&self, now: DateTime<Utc>) -> bool {
        self.is_schedule_active(now) && self.next_execution.is_some_and(|next| now >= next)
    }

    /// Record a fire at `now`. Expires the schedule when the cap is reached,
    /// otherwise moves `next_execution` to the following occurrence.
    pub fn record_execution(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.execution_count += 1;
        self.last_execution = Some(now);
        self.updated_at = now;

        if self.cap_reached() {
            self.expire(now);
            return Ok(());
        }
        self.next_execution = self.occurrence_after(now)?;
        Ok(())
    }

    /// Move past a due occurrence without counting it.
    pub fn skip_occurrence(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.next_execution = self.occurrence_after(now)?;
        self.updated_at = now;
        Ok(())
    }

    /// Pause an active schedule. Returns whether anything changed.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ScheduleStatus::Active {
            return false;
        }
        self.status = ScheduleStatus::Paused;
        self.updated_at = now;
        true
    }

    /// Resume a paused schedule. No-op for any other status.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
        if self.status != ScheduleStatus::Paused {
            return Ok(false);
        }
        self.status = ScheduleStatus::Active;
        self.next_execution = self.first_occurrence(now)?;
        self.updated_at = now;
        Ok(true)
    }

    /// Stop the schedule for good. An EXPIRED or INACTIVE schedule is left
    /// alone. Returns whether anything changed.
    pub fn deactivate(&mut self, now: DateTime<Utc>) -> bool {
        if matches!(self.status, ScheduleStatus::Expired | ScheduleStatus::Inactive) {
            return false;
        }
        self.status = ScheduleStatus::Inactive;
        self.is_active = false;
        self.next_execution = None;
        self.updated_at = now;
        true
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        self.status = ScheduleStatus::Expired;
        self.is_active = false;
        self.next_execution = None;
        self.updated_at = now;
    }

    /// Replace the activation window. A window that already ended
    /// deactivates the schedule unless it has expired.
    pub fn set_execution_window(
        &mut self,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        validate_window(start_at, end_at)?;
        self.start_at = start_at;
        self.end_at = end_at;
        self.updated_at = now;

        if end_at.is_some_and(|end| end < now) {
            self.deactivate(now);
        } else if self.status == ScheduleStatus::Active {
            self.next_execution = self.first_occurrence(now)?;
        }
        Ok(())
    }

    /// Replace the execution cap. A cap already reached expires the schedule.
    pub fn set_max_executions(&mut self, max: Option<u64>, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        if max == Some(0) {
            return Err(ScheduleError::InvalidMaxExecutions);
        }
        self.max_executions = max;
        self.updated_at = now;
        if self.cap_reached() {
            self.expire(now);
        }
        Ok(())
    }

    fn cap_reached(&self) -> bool {
        self.max_executions
            .is_some_and(|max| self.execution_count >= max)
    }

    /// First occurrence at or after `max(now, start_at)`, bounded by `end_at`.
    fn first_occurrence(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let from = match self.start_at {
            Some(start) if start > now => start - Duration::seconds(1),
            _ => now,
        };
        self.occurrence_after(from)
    }

    fn occurrence_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let next = self.expression()?.next_after(after, self.tz()?);
        Ok(next.filter(|next| self.end_at.is_none_or(|end| *next <= end)))
    }
}

fn validate_window(start_at: Option<DateTime<Utc>>, end_at: Option<DateTime<Utc>>) -> Result<(), ScheduleError> {
    match (start_at, end_at) {
        (Some(start), Some(end)) if start > end => Err(ScheduleError::InvalidWindow { start, end }),
        _ => Ok(()),
    }
}
