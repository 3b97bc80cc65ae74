//! Job definition and its lifecycle state machine.
//!
//! A [`Job`] is a unit of deferred work. Its status moves through
//!
//! ```text
//! PENDING -> RUNNING -> COMPLETED
//!                    -> FAILED -> (RETRY -> RUNNING)*
//!                    -> CANCELLED
//! ```
//!
//! `PAUSED` is reachable from any non-terminal state and returns to
//! `PENDING` on resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::backoff::BackoffCalculator;
use super::types::JobId;

/// Maximum length of a job name.
pub const MAX_NAME_LEN: usize = 255;

/// Lowest accepted priority.
pub const MIN_PRIORITY: i32 = 0;

/// Highest accepted priority.
pub const MAX_PRIORITY: i32 = 10;

/// Retries allowed when the creator does not say.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Errors that can occur when working with jobs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// A field failed validation.
    #[error("invalid job: {0}")]
    Validation(String),

    /// The requested transition is not allowed from the current status.
    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Unknown status or type name.
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retry,
    Paused,
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retry,
        JobStatus::Paused,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retry => "retry",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further automatic transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobError::UnknownVariant {
                kind: "job status",
                value: s.to_string(),
            })
    }
}

/// Tag selecting which handler processes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Email,
    PushNotification,
    MessageCleanup,
    MediaProcessing,
    DataExport,
    Webhook,
    Maintenance,
    Custom,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::Email,
        JobType::PushNotification,
        JobType::MessageCleanup,
        JobType::MediaProcessing,
        JobType::DataExport,
        JobType::Webhook,
        JobType::Maintenance,
        JobType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Email => "email",
            JobType::PushNotification => "push_notification",
            JobType::MessageCleanup => "message_cleanup",
            JobType::MediaProcessing => "media_processing",
            JobType::DataExport => "data_export",
            JobType::Webhook => "webhook",
            JobType::Maintenance => "maintenance",
            JobType::Custom => "custom",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobError::UnknownVariant {
                kind: "job type",
                value: s.to_string(),
            })
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// Opaque data handed to the handler.
    pub payload: Value,
    /// Higher is more urgent.
    pub priority: i32,
    pub max_retries: u32,
    /// Retries consumed so far. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// Handler timeout; the worker default applies when unset.
    pub timeout_ms: Option<u64>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    /// Optimistic concurrency counter, bumped by storage on every update.
    pub version: u64,
}

impl Job {
    /// Create a pending job with default settings.
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            job_type,
            status: JobStatus::Pending,
            payload: Value::Object(Default::default()),
            priority: MIN_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            timeout_ms: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            next_retry_at: None,
            error_message: None,
            error_details: None,
            version: 0,
        }
    }

    /// Builder: set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Builder: set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set the retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder: set the handler timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Builder: add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the job may be dispatched.
    pub fn is_executable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Retry)
    }

    /// Whether another automatic retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to RUNNING. Only PENDING and RETRY jobs can start.
    pub fn mark_as_running(&mut self) -> Result<(), JobError> {
        if !self.is_executable() {
            return Err(self.invalid(JobStatus::Running));
        }
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Move a RUNNING job to COMPLETED.
    pub fn mark_as_completed(&mut self) -> Result<(), JobError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Completed));
        }
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failure using the default backoff.
    pub fn mark_as_failed(
        &mut self,
        error: Option<String>,
        details: Option<Value>,
    ) -> Result<(), JobError> {
        self.mark_as_failed_with(error, details, &BackoffCalculator::default())
    }

    /// Record a failure of a RUNNING job.
    ///
    /// If a retry is still available the job lands in RETRY with
    /// `next_retry_at` set from the backoff for the attempt being scheduled;
    /// otherwise it stays FAILED.
    pub fn mark_as_failed_with(
        &mut self,
        error: Option<String>,
        details: Option<Value>,
        backoff: &BackoffCalculator,
    ) -> Result<(), JobError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Failed));
        }
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.failed_at = Some(now);
        self.error_message = error;
        self.error_details = details;
        self.updated_at = now;

        if self.can_retry() {
            self.retry_count += 1;
            self.status = JobStatus::Retry;
            self.next_retry_at = Some(backoff.next_retry_at(self.retry_count, now));
        } else {
            self.next_retry_at = None;
        }
        Ok(())
    }

    /// Operator pause from any non-terminal state.
    pub fn mark_as_paused(&mut self) -> Result<(), JobError> {
        if self.is_terminal() || self.status == JobStatus::Paused {
            return Err(self.invalid(JobStatus::Paused));
        }
        self.status = JobStatus::Paused;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Return a PAUSED job to PENDING, keeping retry count and error fields.
    pub fn resume(&mut self) -> Result<(), JobError> {
        if self.status != JobStatus::Paused {
            return Err(self.invalid(JobStatus::Pending));
        }
        self.status = JobStatus::Pending;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Operator cancellation. Terminal.
    pub fn mark_as_cancelled(&mut self) -> Result<(), JobError> {
        if self.is_terminal() {
            return Err(self.invalid(JobStatus::Cancelled));
        }
        let now = Utc::now();
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Queue another attempt at `at`. A RETRY job keeps the retry it was
    /// already granted; leaving FAILED consumes one, as an automatic retry
    /// would, and needs a retry left.
    pub fn mark_for_retry(&mut self, at: DateTime<Utc>) -> Result<(), JobError> {
        match self.status {
            JobStatus::Retry => {}
            JobStatus::Failed if self.can_retry() => self.retry_count += 1,
            _ => return Err(self.invalid(JobStatus::Retry)),
        }
        self.status = JobStatus::Retry;
        self.next_retry_at = Some(at);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Back to a fresh PENDING state: timestamps, errors and retries cleared.
    pub fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.retry_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.failed_at = None;
        self.next_retry_at = None;
        self.error_message = None;
        self.error_details = None;
        self.updated_at = Utc::now();
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<(), JobError> {
        validate_name(&self.name)?;
        validate_priority(self.priority)?;
        validate_max_retries(self.max_retries)?;
        validate_timeout(self.timeout_ms)?;
        if self.retry_count > self.max_retries {
            return Err(JobError::Validation(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }
        Ok(())
    }

    fn invalid(&self, to: JobStatus) -> JobError {
        JobError::InvalidTransition {
            from: self.status,
            to,
        }
    }
}

/// Client request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default, alias = "maxRetries")]
    pub max_retries: Option<u32>,
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            name: name.into(),
            job_type,
            payload: None,
            priority: None,
            max_retries: None,
            timeout_ms: None,
            metadata: None,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Validate and build a PENDING job with no retries consumed.
    pub fn into_job(self) -> Result<Job, JobError> {
        let mut job = Job::new(self.name.trim(), self.job_type);
        if let Some(payload) = self.payload {
            job.payload = payload;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(max_retries) = self.max_retries {
            job.max_retries = max_retries;
        }
        job.timeout_ms = self.timeout_ms;
        if let Some(metadata) = self.metadata {
            job.metadata = metadata;
        }
        job.validate()?;
        Ok(job)
    }
}

/// Partial update of a job. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default, alias = "maxRetries")]
    pub max_retries: Option<u32>,
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.job_type.is_none()
            && self.payload.is_none()
            && self.priority.is_none()
            && self.max_retries.is_none()
            && self.timeout_ms.is_none()
            && self.metadata.is_none()
    }

    /// Merge into `job`. The job is left unchanged if the result is invalid.
    pub fn apply(&self, job: &mut Job) -> Result<(), JobError> {
        let mut updated = job.clone();
        if let Some(name) = &self.name {
            updated.name = name.trim().to_string();
        }
        if let Some(job_type) = self.job_type {
            updated.job_type = job_type;
        }
        if let Some(payload) = &self.payload {
            updated.payload = payload.clone();
        }
        if let Some(priority) = self.priority {
            updated.priority = priority;
        }
        if let Some(max_retries) = self.max_retries {
            updated.max_retries = max_retries;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            updated.timeout_ms = Some(timeout_ms);
        }
        if let Some(metadata) = &self.metadata {
            updated.metadata.extend(metadata.clone());
        }
        updated.validate()?;
        updated.updated_at = Utc::now();
        *job = updated;
        Ok(())
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default, rename = "type")]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.job_type.is_none_or(|t| t == job.job_type)
    }
}

fn validate_name(name: &str) -> Result<(), JobError> {
    if name.trim().is_empty() {
        return Err(JobError::Validation("name is required".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(JobError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_priority(priority: i32) -> Result<(), JobError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(JobError::Validation(format!(
            "priority must be between {} and {}",
            MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    Ok(())
}

fn validate_max_retries(max_retries: u32) -> Result<(), JobError> {
    if max_retries > MAX_RETRIES_LIMIT {
        return Err(JobError::Validation(format!(
            "max_retries must be at most {}",
            MAX_RETRIES_LIMIT
        )));
    }
    Ok(())
}

fn validate_timeout(timeout_ms: Option<u64>) -> Result<(), JobError> {
    if timeout_ms == Some(0) {
        return Err(JobError::Validation("timeout_ms must be positive".into()));
    }
    Ok(())
}
