//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the
//! scheduler.

use std::fmt;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::cron::CronError;
use crate::core::job::JobError;
use crate::core::schedule::ScheduleError;
use crate::queue::QueueError;
use crate::storage::StorageError;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Unknown job, schedule or execution.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input such as a bad cron expression or job spec.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The job is not in a state that permits the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Duplicate resource or a write that kept losing to concurrent writers.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store or the broker failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// Coarse classification of a [`SchedulerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    InvalidState,
    Conflict,
    Upstream,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Upstream => "UPSTREAM_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::NotFound(_) => ErrorKind::NotFound,
            SchedulerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SchedulerError::InvalidState(_) => ErrorKind::InvalidState,
            SchedulerError::Conflict(_) => ErrorKind::Conflict,
            SchedulerError::Upstream(_) => ErrorKind::Upstream,
            SchedulerError::ChannelError(_) => ErrorKind::Internal,
        }
    }
}

impl From<StorageError> for SchedulerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => SchedulerError::NotFound(msg),
            StorageError::DuplicateKey(msg) => SchedulerError::Conflict(msg),
            StorageError::VersionConflict(msg) => SchedulerError::Conflict(msg),
            other => SchedulerError::Upstream(other.to_string()),
        }
    }
}

impl From<QueueError> for SchedulerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(msg) => SchedulerError::NotFound(msg),
            QueueError::Duplicate(msg) => SchedulerError::Conflict(msg),
            QueueError::InvalidState { .. } => SchedulerError::InvalidState(err.to_string()),
            QueueError::UnknownQueue(_) | QueueError::InvalidArgument(_) => {
                SchedulerError::InvalidArgument(err.to_string())
            }
            QueueError::LockPoisoned | QueueError::Backend(_) => {
                SchedulerError::Upstream(err.to_string())
            }
        }
    }
}

impl From<JobError> for SchedulerError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidTransition { .. } => SchedulerError::InvalidState(err.to_string()),
            JobError::Validation(_) | JobError::UnknownVariant { .. } => {
                SchedulerError::InvalidArgument(err.to_string())
            }
        }
    }
}

impl From<ScheduleError> for SchedulerError {
    fn from(err: ScheduleError) -> Self {
        SchedulerError::InvalidArgument(err.to_string())
    }
}

impl From<CronError> for SchedulerError {
    fn from(err: CronError) -> Self {
        SchedulerError::InvalidArgument(err.to_string())
    }
}

/// State of the schedule runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Runner is stopped.
    Stopped,
    /// Runner is firing due schedules.
    Running,
    /// Runner is paused; due schedules wait.
    Paused,
}

/// Commands that can be sent to the schedule runner.
pub(crate) enum SchedulerCommand {
    /// Fire due schedules immediately.
    Tick {
        response: oneshot::Sender<Result<usize, SchedulerError>>,
    },
    /// Pause the runner.
    Pause { response: oneshot::Sender<()> },
    /// Resume the runner.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the runner.
    Shutdown { response: oneshot::Sender<()> },
}
