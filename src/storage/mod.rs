//! Storage abstraction for jobs, schedules and execution records.
//!
//! The store is the source of truth for job state. Updates to jobs and
//! executions use optimistic concurrency: every record carries a `version`
//! and an update only succeeds against the version it was read at. Backends
//! bump the version in place on success so callers can keep using the
//! record.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::core::execution::JobExecution;
use crate::core::job::{Job, JobFilter, JobStatus};
use crate::core::schedule::JobSchedule;
use crate::core::types::{ExecutionId, JobId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The record changed since it was read.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::SerializationError(e.to_string())
    }
}

/// Storage trait for persisting engine state.
#[async_trait]
pub trait Storage: Send + Sync {
    // Job operations

    /// Insert a new job.
    async fn insert_job(&self, job: Job) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError>;

    /// List jobs matching `filter`, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError>;

    /// Replace a job if its version is unchanged. Bumps `job.version`.
    async fn update_job(&self, job: &mut Job) -> Result<(), StorageError>;

    /// Delete a job together with its schedule and executions.
    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError>;

    /// Number of jobs per status. Statuses with no jobs are omitted.
    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>, StorageError>;

    // Schedule operations

    /// Insert or replace the schedule of `schedule.job_id`.
    async fn upsert_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError>;

    /// Replace the schedule of `schedule.job_id` if it is still the same
    /// schedule at the same version. Bumps `schedule.version`.
    ///
    /// Fails with `NotFound` once the schedule was removed and with
    /// `VersionConflict` when it changed or was replaced meanwhile.
    async fn update_schedule(&self, schedule: &mut JobSchedule) -> Result<(), StorageError>;

    /// Get the schedule attached to a job.
    async fn get_schedule(&self, job_id: &JobId) -> Result<JobSchedule, StorageError>;

    /// List all schedules.
    async fn list_schedules(&self) -> Result<Vec<JobSchedule>, StorageError>;

    /// Remove the schedule attached to a job.
    async fn delete_schedule(&self, job_id: &JobId) -> Result<(), StorageError>;

    // Execution operations

    /// Get an execution by ID.
    async fn get_execution(&self, id: &ExecutionId) -> Result<JobExecution, StorageError>;

    /// List executions for a job, most recent first.
    /// Returns at most `limit` executions.
    async fn list_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobExecution>, StorageError>;

    /// Atomically update `job` and insert the execution created for it.
    async fn record_dispatch(
        &self,
        job: &mut Job,
        execution: &mut JobExecution,
    ) -> Result<(), StorageError>;

    /// Atomically update `job` (when given) and `executions`.
    ///
    /// Every record is checked against its version before anything is
    /// written.
    async fn record_outcome(
        &self,
        job: Option<&mut Job>,
        executions: &mut [JobExecution],
    ) -> Result<(), StorageError>;
}
