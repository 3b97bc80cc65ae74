//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{Storage, StorageError};
use crate::core::execution::JobExecution;
use crate::core::job::{Job, JobFilter, JobStatus};
use crate::core::schedule::JobSchedule;
use crate::core::types::{ExecutionId, JobId};

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    schedules: HashMap<JobId, JobSchedule>,
    executions: HashMap<ExecutionId, JobExecution>,
}

impl Tables {
    fn check_job(&self, job: &Job) -> Result<(), StorageError> {
        let stored = self
            .jobs
            .get(&job.id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", job.id)))?;
        if stored.version != job.version {
            return Err(StorageError::VersionConflict(format!(
                "job {}: expected version {}, found {}",
                job.id, job.version, stored.version
            )));
        }
        Ok(())
    }

    fn check_execution(&self, execution: &JobExecution) -> Result<(), StorageError> {
        let stored = self
            .executions
            .get(&execution.id)
            .ok_or_else(|| StorageError::NotFound(format!("execution: {}", execution.id)))?;
        if stored.version != execution.version {
            return Err(StorageError::VersionConflict(format!(
                "execution {}: expected version {}, found {}",
                execution.id, execution.version, stored.version
            )));
        }
        Ok(())
    }

    fn write_job(&mut self, job: &mut Job) {
        job.version += 1;
        self.jobs.insert(job.id.clone(), job.clone());
    }

    fn write_execution(&mut self, execution: &mut JobExecution) {
        execution.version += 1;
        self.executions
            .insert(execution.id.clone(), execution.clone());
    }
}

/// In-memory storage backend.
///
/// All tables sit behind one RwLock so multi-record updates are atomic.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        if tables.jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        tables.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        tables
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = tables
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn update_job(&self, job: &mut Job) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        tables.check_job(job)?;
        tables.write_job(job);
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        tables
            .jobs
            .remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        tables.schedules.remove(id);
        tables.executions.retain(|_, e| &e.job_id != id);
        Ok(())
    }

    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut counts = HashMap::new();
        for job in tables.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn upsert_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        if !tables.jobs.contains_key(&schedule.job_id) {
            return Err(StorageError::NotFound(format!("job: {}", schedule.job_id)));
        }
        tables.schedules.insert(schedule.job_id.clone(), schedule);
        Ok(())
    }

    async fn update_schedule(&self, schedule: &mut JobSchedule) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let current = tables
            .schedules
            .get_mut(&schedule.job_id)
            .ok_or_else(|| StorageError::NotFound(format!("schedule for job: {}", schedule.job_id)))?;
        if current.id != schedule.id || current.version != schedule.version {
            return Err(StorageError::VersionConflict(format!(
                "schedule {}: expected version {}, found {} (schedule {})",
                schedule.id, schedule.version, current.version, current.id
            )));
        }
        schedule.version += 1;
        *current = schedule.clone();
        Ok(())
    }

    async fn get_schedule(&self, job_id: &JobId) -> Result<JobSchedule, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        tables
            .schedules
            .get(job_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("schedule for job: {}", job_id)))
    }

    async fn list_schedules(&self) -> Result<Vec<JobSchedule>, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = tables.schedules.values().cloned().collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn delete_schedule(&self, job_id: &JobId) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        tables
            .schedules
            .remove(job_id)
            .ok_or_else(|| StorageError::NotFound(format!("schedule for job: {}", job_id)))?;
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<JobExecution, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        tables
            .executions
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("execution: {}", id)))
    }

    async fn list_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobExecution>, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = tables
            .executions
            .values()
            .filter(|e| &e.job_id == job_id)
            .cloned()
            .collect();
        // Most recent first
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn record_dispatch(
        &self,
        job: &mut Job,
        execution: &mut JobExecution,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        tables.check_job(job)?;
        if tables.executions.contains_key(&execution.id) {
            return Err(StorageError::DuplicateKey(format!(
                "execution: {}",
                execution.id
            )));
        }
        tables.write_job(job);
        tables
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn record_outcome(
        &self,
        job: Option<&mut Job>,
        executions: &mut [JobExecution],
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(job) = job.as_deref() {
            tables.check_job(job)?;
        }
        for execution in executions.iter() {
            tables.check_execution(execution)?;
        }

        if let Some(job) = job {
            tables.write_job(job);
        }
        for execution in executions.iter_mut() {
            tables.write_execution(execution);
        }
        Ok(())
    }
}
