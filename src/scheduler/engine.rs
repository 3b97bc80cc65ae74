//! Scheduler engine implementation.
//!
//! The engine is responsible for:
//! - Creating, updating and deleting jobs
//! - Attaching schedules and firing them when due
//! - Driving job and execution transitions
//! - Handing work to the broker and taking retries back out of it
//! - Event emission
//!
//! The store is the source of truth; the broker only delivers work. Every
//! read-modify-write goes through the store's versioned updates and is
//! replayed when a concurrent writer got there first, so there is no
//! in-process lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::backoff::BackoffCalculator;
use crate::core::execution::{ExecutionStatus, JobExecution};
use crate::core::job::{Job, JobFilter, JobPatch, JobStatus, NewJob};
use crate::core::schedule::{JobSchedule, ScheduleOptions, ScheduleStatus};
use crate::core::types::{ExecutionId, JobId};
use crate::events::{Event, EventBus};
use crate::queue::{QueueError, QueueRouter, RepeatableJob, RouteOptions};
use crate::storage::{Storage, StorageError};

use super::types::SchedulerError;

/// Attempts at a versioned write before giving up with `Conflict`.
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// Payload of a broker item created by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    /// Set when the execution was recorded at dispatch. Retry deliveries
    /// carry none and are claimed by the worker.
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> Value {
        json!({
            "job_id": self.job_id,
            "execution_id": self.execution_id,
            "payload": self.payload,
        })
    }
}

/// Job counts grouped by status. Every status is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total: u64,
    pub by_status: BTreeMap<JobStatus, u64>,
}

/// A job moved to RUNNING together with its new execution.
struct Dispatched {
    job: Job,
    prior: Job,
    execution: JobExecution,
}

/// What started an execution. Kept in its `execution_context`.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// `execute_job`.
    Manual,
    /// A due schedule.
    Schedule,
    /// A worker claiming a delivery that carried no execution.
    Claim,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Schedule => "schedule",
            Trigger::Claim => "claim",
        }
    }
}

enum Failure {
    Error {
        message: String,
        details: Option<Value>,
    },
    Timeout {
        message: String,
    },
}

/// Orchestrates jobs, schedules and executions over a store and a broker.
pub struct SchedulerEngine<S: Storage> {
    /// Storage backend.
    storage: Arc<S>,
    /// Broker routing.
    router: Arc<QueueRouter>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Retry delays for failed executions.
    backoff: BackoffCalculator,
}

impl<S: Storage + 'static> SchedulerEngine<S> {
    /// Create a new engine over `storage` and `router`.
    pub fn new(storage: Arc<S>, router: Arc<QueueRouter>) -> Self {
        Self {
            storage,
            router,
            event_bus: Arc::new(EventBus::new()),
            backoff: BackoffCalculator::default(),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the retry backoff.
    pub fn with_backoff(mut self, backoff: BackoffCalculator) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn router(&self) -> &Arc<QueueRouter> {
        &self.router
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }

    // Jobs

    /// Validate `spec` and persist it as a PENDING job.
    pub async fn create_job(&self, spec: NewJob) -> Result<Job, SchedulerError> {
        let job = spec.into_job()?;
        self.storage.insert_job(job.clone()).await?;

        tracing::info!(job_id = %job.id, job_type = %job.job_type, "Job created");
        self.event_bus
            .emit(Event::job_created(job.id.clone(), job.job_type))
            .await;
        Ok(job)
    }

    pub async fn find_job_by_id(&self, id: &JobId) -> Result<Job, SchedulerError> {
        Ok(self.storage.get_job(id).await?)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.storage.list_jobs(filter).await?)
    }

    /// Merge `patch` into a job.
    pub async fn update_job(&self, id: &JobId, patch: JobPatch) -> Result<Job, SchedulerError> {
        if patch.is_empty() {
            return self.find_job_by_id(id).await;
        }
        let job = self
            .update_job_with(id, |job| Ok(patch.apply(job)?))
            .await?;
        tracing::debug!(job_id = %id, "Job updated");
        Ok(job)
    }

    /// Delete a job with its schedule and executions. Broker cleanup is
    /// best-effort.
    pub async fn delete_job(&self, id: &JobId) -> Result<(), SchedulerError> {
        self.storage.get_job(id).await?;

        self.remove_deliveries(id).await;
        if let Err(e) = self.router.remove_repeatable(&id.to_string()).await {
            tracing::warn!(job_id = %id, error = %e, "Failed to remove broker recurrence");
        }
        self.storage.delete_job(id).await?;

        tracing::info!(job_id = %id, "Job deleted");
        self.event_bus.emit(Event::job_deleted(id.clone())).await;
        Ok(())
    }

    // Schedules

    /// Attach a schedule to a job, replacing any existing one, and register
    /// the recurrence with the broker.
    pub async fn schedule_job(
        &self,
        job_id: &JobId,
        options: ScheduleOptions,
    ) -> Result<JobSchedule, SchedulerError> {
        let job = self.storage.get_job(job_id).await?;
        let schedule = JobSchedule::new(job_id.clone(), options, Utc::now())?;

        let key = job_id.to_string();
        let registration = RepeatableJob {
            key: key.clone(),
            name: job.job_type.to_string(),
            cron: schedule.cron_expression.clone(),
            timezone: schedule.timezone.clone(),
            data: WorkItem {
                job_id: job_id.clone(),
                execution_id: None,
                payload: job.payload.clone(),
            }
            .to_value(),
            next_run: schedule.next_execution,
        };
        let queue = self
            .router
            .add_repeatable(registration, job.priority)
            .await
            .map_err(|e| upstream("register schedule", job_id, e))?;

        if let Err(e) = self.storage.upsert_schedule(schedule.clone()).await {
            if let Err(remove_err) = self.router.remove_repeatable(&key).await {
                tracing::warn!(job_id = %job_id, error = %remove_err, "Failed to remove broker recurrence");
            }
            return Err(e.into());
        }

        tracing::info!(
            job_id = %job_id,
            cron = %schedule.cron_expression,
            timezone = %schedule.timezone,
            queue = %queue,
            next_execution = ?schedule.next_execution,
            "Schedule attached"
        );
        Ok(schedule)
    }

    pub async fn get_schedule(&self, job_id: &JobId) -> Result<JobSchedule, SchedulerError> {
        Ok(self.storage.get_schedule(job_id).await?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<JobSchedule>, SchedulerError> {
        Ok(self.storage.list_schedules().await?)
    }

    /// Pause an active schedule. Any other status is left alone.
    pub async fn pause_schedule(&self, job_id: &JobId) -> Result<JobSchedule, SchedulerError> {
        let (schedule, changed) = self
            .update_schedule_with(job_id, |schedule| Ok(schedule.pause(Utc::now())))
            .await?;
        if changed {
            tracing::info!(job_id = %job_id, "Schedule paused");
        }
        Ok(schedule)
    }

    /// Resume a paused schedule. Any other status is left alone.
    pub async fn resume_schedule(&self, job_id: &JobId) -> Result<JobSchedule, SchedulerError> {
        let (schedule, changed) = self
            .update_schedule_with(job_id, |schedule| Ok(schedule.resume(Utc::now())?))
            .await?;
        if changed {
            tracing::info!(job_id = %job_id, next_execution = ?schedule.next_execution, "Schedule resumed");
        }
        Ok(schedule)
    }

    /// Stop a schedule for good. It stays attached for inspection.
    pub async fn deactivate_schedule(&self, job_id: &JobId) -> Result<JobSchedule, SchedulerError> {
        let (schedule, changed) = self
            .update_schedule_with(job_id, |schedule| Ok(schedule.deactivate(Utc::now())))
            .await?;
        if let Err(e) = self.router.remove_repeatable(&job_id.to_string()).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove broker recurrence");
        }
        if changed {
            tracing::info!(job_id = %job_id, "Schedule deactivated");
        }
        Ok(schedule)
    }

    /// Detach the schedule from a job.
    pub async fn unschedule_job(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        self.storage.delete_schedule(job_id).await?;
        if let Err(e) = self.router.remove_repeatable(&job_id.to_string()).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove broker recurrence");
        }
        tracing::info!(job_id = %job_id, "Schedule removed");
        Ok(())
    }

    // Execution

    /// Dispatch a PENDING or RETRY job now.
    ///
    /// The job and its RUNNING execution are committed before the broker
    /// item is enqueued. If the enqueue fails the dispatch is rolled back
    /// and the error is returned.
    pub async fn execute_job(&self, job_id: &JobId) -> Result<JobExecution, SchedulerError> {
        self.start_execution(job_id, Trigger::Manual).await
    }

    async fn start_execution(
        &self,
        job_id: &JobId,
        trigger: Trigger,
    ) -> Result<JobExecution, SchedulerError> {
        let dispatched = self.dispatch(job_id, trigger, None, None).await?;

        self.remove_deliveries(job_id).await;
        let item = WorkItem {
            job_id: job_id.clone(),
            execution_id: Some(dispatched.execution.id.clone()),
            payload: dispatched.job.payload.clone(),
        };
        let enqueued = self
            .router
            .add_job(
                dispatched.job.job_type.as_str(),
                item.to_value(),
                route(&dispatched.job, 0),
            )
            .await;

        let queue_item = match enqueued {
            Ok(queue_item) => queue_item,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue job, rolling back dispatch");
                let reason = e.to_string();
                self.roll_back_dispatch(dispatched, &reason).await;
                return Err(upstream("enqueue job", job_id, e));
            }
        };

        let execution = dispatched.execution;
        tracing::info!(
            job_id = %job_id,
            execution_id = %execution.id,
            queue = %queue_item.queue,
            "Job dispatched"
        );
        self.event_bus
            .emit(Event::job_started(job_id.clone(), execution.id.clone()))
            .await;
        Ok(execution)
    }

    /// Start an execution for a delivery that carries none, such as a retry.
    ///
    /// Returns `None` when the job can no longer run (paused, cancelled,
    /// already running or finished) so the worker drops the delivery.
    pub async fn claim_job(
        &self,
        job_id: &JobId,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<JobExecution>, SchedulerError> {
        match self
            .dispatch(job_id, Trigger::Claim, Some(queue), Some(worker_id))
            .await
        {
            Ok(dispatched) => {
                let execution = dispatched.execution;
                tracing::debug!(job_id = %job_id, execution_id = %execution.id, worker_id, "Job claimed");
                self.event_bus
                    .emit(Event::job_started(job_id.clone(), execution.id.clone()))
                    .await;
                Ok(Some(execution))
            }
            Err(SchedulerError::InvalidState(reason)) => {
                tracing::debug!(job_id = %job_id, reason = %reason, "Dropping delivery");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Record a successful execution and complete its job.
    ///
    /// A finished execution is returned unchanged. A job that is no longer
    /// RUNNING, e.g. cancelled or paused meanwhile, keeps its status.
    pub async fn complete_job_execution(
        &self,
        execution_id: &ExecutionId,
        output: Option<Value>,
    ) -> Result<JobExecution, SchedulerError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut execution = self.storage.get_execution(execution_id).await?;
            if execution.is_terminal() {
                tracing::debug!(execution_id = %execution_id, status = %execution.status, "Execution already finished, ignoring completion");
                return Ok(execution);
            }
            let mut job = self.storage.get_job(&execution.job_id).await?;

            execution.complete(output.clone());
            let job_moves = job.status == JobStatus::Running;
            if job_moves {
                job.mark_as_completed()?;
            }

            let result = self
                .storage
                .record_outcome(
                    job_moves.then_some(&mut job),
                    std::slice::from_mut(&mut execution),
                )
                .await;
            match result {
                Ok(()) => {
                    let duration_ms = execution.duration_ms.unwrap_or(0);
                    if job_moves {
                        tracing::info!(job_id = %job.id, execution_id = %execution_id, duration_ms, "Job completed");
                        self.event_bus
                            .emit(Event::job_completed(
                                job.id.clone(),
                                execution_id.clone(),
                                duration_ms,
                            ))
                            .await;
                    } else {
                        tracing::debug!(job_id = %job.id, status = %job.status, "Job no longer running, status kept");
                    }
                    return Ok(execution);
                }
                Err(StorageError::VersionConflict(_)) => {
                    tracing::debug!(execution_id = %execution_id, attempt, "Concurrent update, retrying completion");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Conflict(format!(
            "execution {} kept changing during update",
            execution_id
        )))
    }

    /// Record a failed execution. The job moves to RETRY, with a delayed
    /// delivery enqueued, or to FAILED once its retries are used up.
    pub async fn fail_job_execution(
        &self,
        execution_id: &ExecutionId,
        error: impl Into<String>,
        details: Option<Value>,
    ) -> Result<JobExecution, SchedulerError> {
        let failure = Failure::Error {
            message: error.into(),
            details,
        };
        self.record_failure(execution_id, failure).await
    }

    /// Record that a handler ran past its timeout. The job fails as with
    /// [`fail_job_execution`](Self::fail_job_execution).
    pub async fn timeout_job_execution(
        &self,
        execution_id: &ExecutionId,
        timeout: Duration,
    ) -> Result<JobExecution, SchedulerError> {
        let failure = Failure::Timeout {
            message: format!("execution timed out after {}ms", timeout.as_millis()),
        };
        self.record_failure(execution_id, failure).await
    }

    // Lifecycle actions

    /// Cancel a job and its RUNNING executions. A handler already running is
    /// not interrupted; its later report is ignored.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut job = self.storage.get_job(job_id).await?;
            job.mark_as_cancelled()?;

            let mut running: Vec<JobExecution> = self
                .storage
                .list_executions(job_id, usize::MAX)
                .await?
                .into_iter()
                .filter(|execution| execution.status == ExecutionStatus::Running)
                .collect();
            for execution in &mut running {
                execution.cancel();
            }

            match self.storage.record_outcome(Some(&mut job), &mut running).await {
                Ok(()) => {
                    self.remove_deliveries(job_id).await;
                    tracing::info!(job_id = %job_id, cancelled_executions = running.len(), "Job cancelled");
                    self.event_bus.emit(Event::job_cancelled(job_id.clone())).await;
                    return Ok(job);
                }
                Err(StorageError::VersionConflict(_)) => {
                    tracing::debug!(job_id = %job_id, attempt, "Concurrent update, retrying cancel");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(contention(job_id))
    }

    /// Pause a job. Pending and retry deliveries are dropped; a delivery
    /// already dispatched still runs and its outcome leaves the job paused.
    pub async fn pause_job(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        let mut was_running = false;
        let job = self
            .update_job_with(job_id, |job| {
                was_running = job.status == JobStatus::Running;
                Ok(job.mark_as_paused()?)
            })
            .await?;
        if !was_running {
            self.remove_deliveries(job_id).await;
        }

        tracing::info!(job_id = %job_id, "Job paused");
        self.event_bus.emit(Event::job_paused(job_id.clone())).await;
        Ok(job)
    }

    /// Return a paused job to PENDING. Nothing is enqueued.
    pub async fn resume_job(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        let job = self
            .update_job_with(job_id, |job| Ok(job.resume()?))
            .await?;

        tracing::info!(job_id = %job_id, "Job resumed");
        self.event_bus.emit(Event::job_resumed(job_id.clone())).await;
        Ok(job)
    }

    /// Retry a RETRY job now, or a FAILED job that has retries left.
    ///
    /// If the delivery cannot be enqueued the job is put back as it was and
    /// any earlier delivery is left in place.
    pub async fn retry_job(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        let now = Utc::now();
        let mut prior = None;
        let job = self
            .update_job_with(job_id, |job| {
                prior = Some(job.clone());
                Ok(job.mark_for_retry(now)?)
            })
            .await?;
        if let Err(e) = self.enqueue_retry(&job, now).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue retry, rolling back");
            if let Some(prior) = prior {
                self.roll_back_retry(&job, &prior).await;
            }
            return Err(upstream("enqueue retry", job_id, e));
        }

        tracing::info!(job_id = %job_id, retry_count = job.retry_count, "Job retry requested");
        self.event_bus
            .emit(Event::job_retrying(
                job_id.clone(),
                job.retry_count,
                job.max_retries,
                now,
            ))
            .await;
        Ok(job)
    }

    /// Reset a FAILED or CANCELLED job to a fresh PENDING state.
    pub async fn requeue_job(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        let job = self
            .update_job_with(job_id, |job| match job.status {
                JobStatus::Failed | JobStatus::Cancelled => {
                    job.reset();
                    Ok(())
                }
                other => Err(SchedulerError::InvalidState(format!(
                    "job {} is {}, only failed or cancelled jobs can be requeued",
                    job.id, other
                ))),
            })
            .await?;
        self.remove_deliveries(job_id).await;

        tracing::info!(job_id = %job_id, "Job requeued");
        Ok(job)
    }

    // Queries

    pub async fn get_job_statistics(&self) -> Result<JobStatistics, SchedulerError> {
        let counts = self.storage.count_jobs_by_status().await?;
        let by_status: BTreeMap<JobStatus, u64> = JobStatus::ALL
            .iter()
            .map(|status| (*status, counts.get(status).copied().unwrap_or(0)))
            .collect();
        let total = by_status.values().sum();
        Ok(JobStatistics { total, by_status })
    }

    /// The `limit` most recent executions of a job.
    pub async fn get_job_history(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobExecution>, SchedulerError> {
        self.storage.get_job(job_id).await?;
        Ok(self.storage.list_executions(job_id, limit).await?)
    }

    /// Every execution of a job, most recent first.
    pub async fn get_job_executions(&self, job_id: &JobId) -> Result<Vec<JobExecution>, SchedulerError> {
        self.get_job_history(job_id, usize::MAX).await
    }

    pub async fn get_execution(&self, id: &ExecutionId) -> Result<JobExecution, SchedulerError> {
        Ok(self.storage.get_execution(id).await?)
    }

    // Recurrence

    /// Fire every schedule due at `now`. Returns how many dispatched their
    /// job. A failing schedule is logged and does not stop the others.
    pub async fn fire_due_schedules(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let schedules = self.storage.list_schedules().await?;
        let mut fired = 0;

        for schedule in schedules {
            if !schedule.should_execute_now(now) {
                continue;
            }
            let job_id = schedule.job_id.clone();
            match self.fire_schedule(schedule, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to fire schedule");
                }
            }
        }
        Ok(fired)
    }

    /// Dispatch the job of one due schedule. A job that finished is reset
    /// first; a job that is busy or held skips the occurrence.
    async fn fire_schedule(
        &self,
        fired: JobSchedule,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let job = self.storage.get_job(&fired.job_id).await?;

        match job.status {
            JobStatus::Pending => {}
            JobStatus::Completed | JobStatus::Failed => {
                self.update_job_with(&job.id, |job| match job.status {
                    JobStatus::Completed | JobStatus::Failed => {
                        job.reset();
                        Ok(())
                    }
                    JobStatus::Pending => Ok(()),
                    other => Err(SchedulerError::InvalidState(format!(
                        "job {} is {}",
                        job.id, other
                    ))),
                })
                .await?;
            }
            JobStatus::Running | JobStatus::Retry | JobStatus::Paused | JobStatus::Cancelled => {
                self.advance_schedule(&fired, now, false).await?;
                tracing::debug!(job_id = %job.id, status = %job.status, "Skipping scheduled occurrence");
                return Ok(false);
            }
        }

        let execution = match self.start_execution(&job.id, Trigger::Schedule).await {
            Ok(execution) => execution,
            Err(e) => {
                self.advance_schedule(&fired, now, false).await?;
                return Err(e);
            }
        };

        let Some(schedule) = self.advance_schedule(&fired, now, true).await? else {
            tracing::debug!(job_id = %job.id, execution_id = %execution.id, "Schedule changed while firing, occurrence not recorded");
            return Ok(true);
        };
        tracing::info!(
            job_id = %job.id,
            execution_id = %execution.id,
            execution_count = schedule.execution_count,
            next_execution = ?schedule.next_execution,
            "Schedule fired"
        );
        self.event_bus
            .emit(Event::schedule_fired(
                job.id.clone(),
                schedule.id.clone(),
                schedule.execution_count,
            ))
            .await;

        if schedule.status == ScheduleStatus::Expired {
            if let Err(e) = self.router.remove_repeatable(&job.id.to_string()).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to remove broker recurrence");
            }
            tracing::info!(job_id = %job.id, "Schedule expired");
            self.event_bus
                .emit(Event::schedule_expired(job.id.clone(), schedule.id.clone()))
                .await;
        }
        Ok(true)
    }

    /// Move the stored schedule past the occurrence `fired` was due for,
    /// counting it when `record` is set.
    ///
    /// Writes nothing and returns `None` when the schedule was removed,
    /// replaced, stopped or already moved past that occurrence meanwhile.
    async fn advance_schedule(
        &self,
        fired: &JobSchedule,
        now: DateTime<Utc>,
        record: bool,
    ) -> Result<Option<JobSchedule>, SchedulerError> {
        let result = self
            .update_schedule_with(&fired.job_id, |schedule| {
                let same_occurrence = schedule.id == fired.id
                    && schedule.next_execution == fired.next_execution
                    && matches!(schedule.status, ScheduleStatus::Active | ScheduleStatus::Paused);
                if !same_occurrence {
                    return Ok(false);
                }
                if record {
                    schedule.record_execution(now)?;
                } else {
                    schedule.skip_occurrence(now)?;
                }
                Ok(true)
            })
            .await;
        match result {
            Ok((schedule, true)) => Ok(Some(schedule)),
            Ok((_, false)) | Err(SchedulerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // Internals

    /// Re-read, apply and write a job until the write wins.
    async fn update_job_with<F>(&self, id: &JobId, mut apply: F) -> Result<Job, SchedulerError>
    where
        F: FnMut(&mut Job) -> Result<(), SchedulerError>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut job = self.storage.get_job(id).await?;
            apply(&mut job)?;
            match self.storage.update_job(&mut job).await {
                Ok(()) => return Ok(job),
                Err(StorageError::VersionConflict(_)) => {
                    tracing::debug!(job_id = %id, attempt, "Concurrent update, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(contention(id))
    }

    /// Re-read, apply and write a schedule until the write wins. `apply`
    /// returns whether it changed anything; unchanged schedules are not
    /// written.
    async fn update_schedule_with<F>(
        &self,
        job_id: &JobId,
        mut apply: F,
    ) -> Result<(JobSchedule, bool), SchedulerError>
    where
        F: FnMut(&mut JobSchedule) -> Result<bool, SchedulerError>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut schedule = self.storage.get_schedule(job_id).await?;
            if !apply(&mut schedule)? {
                return Ok((schedule, false));
            }
            match self.storage.update_schedule(&mut schedule).await {
                Ok(()) => return Ok((schedule, true)),
                Err(StorageError::VersionConflict(_)) => {
                    tracing::debug!(job_id = %job_id, attempt, "Concurrent schedule update, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Conflict(format!(
            "schedule of job {} kept changing during update",
            job_id
        )))
    }

    /// Move an executable job to RUNNING and record its execution in one
    /// write.
    async fn dispatch(
        &self,
        job_id: &JobId,
        trigger: Trigger,
        queue: Option<&str>,
        worker_id: Option<&str>,
    ) -> Result<Dispatched, SchedulerError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut job = self.storage.get_job(job_id).await?;
            if !job.is_executable() {
                return Err(SchedulerError::InvalidState(format!(
                    "job {} is {} and cannot be executed",
                    job_id, job.status
                )));
            }
            let prior = job.clone();
            job.mark_as_running()?;

            let queue = match queue {
                Some(queue) => queue.to_string(),
                None => self.router.select_queue(&route(&job, 0)).to_string(),
            };
            let mut execution = JobExecution::start(&job)
                .with_queue(queue)
                .with_context("trigger", trigger.as_str());
            if let Some(worker_id) = worker_id {
                execution = execution.with_worker(worker_id);
            }

            match self.storage.record_dispatch(&mut job, &mut execution).await {
                Ok(()) => {
                    return Ok(Dispatched {
                        job,
                        prior,
                        execution,
                    });
                }
                Err(StorageError::VersionConflict(_)) => {
                    tracing::debug!(job_id = %job_id, attempt, "Concurrent update, retrying dispatch");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(contention(job_id))
    }

    /// Put a job back where it was before a dispatch whose delivery failed.
    async fn roll_back_dispatch(&self, dispatched: Dispatched, reason: &str) {
        let Dispatched {
            mut job,
            prior,
            mut execution,
        } = dispatched;

        job.status = prior.status;
        job.started_at = prior.started_at;
        job.next_retry_at = prior.next_retry_at;
        job.updated_at = Utc::now();
        execution.cancel();
        execution.error_message = Some(format!("dispatch failed: {}", reason));

        if let Err(e) = self
            .storage
            .record_outcome(Some(&mut job), std::slice::from_mut(&mut execution))
            .await
        {
            tracing::error!(job_id = %job.id, error = %e, "Failed to roll back dispatch");
        }
    }

    /// Undo a manual retry whose delivery failed, unless the job moved on.
    async fn roll_back_retry(&self, retried: &Job, prior: &Job) {
        let result = self
            .update_job_with(&retried.id, |job| {
                if job.status == JobStatus::Retry && job.retry_count == retried.retry_count {
                    job.status = prior.status;
                    job.retry_count = prior.retry_count;
                    job.next_retry_at = prior.next_retry_at;
                    job.updated_at = Utc::now();
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(job_id = %retried.id, error = %e, "Failed to roll back retry");
        }
    }

    async fn record_failure(
        &self,
        execution_id: &ExecutionId,
        failure: Failure,
    ) -> Result<JobExecution, SchedulerError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut execution = self.storage.get_execution(execution_id).await?;
            if execution.is_terminal() {
                tracing::debug!(execution_id = %execution_id, status = %execution.status, "Execution already finished, ignoring failure");
                return Ok(execution);
            }
            let mut job = self.storage.get_job(&execution.job_id).await?;

            let (message, details) = match &failure {
                Failure::Error { message, details } => {
                    execution.fail(message.clone(), details.clone());
                    (message.clone(), details.clone())
                }
                Failure::Timeout { message } => {
                    execution.time_out(message.clone());
                    (message.clone(), None)
                }
            };
            let job_moves = job.status == JobStatus::Running;
            if job_moves {
                job.mark_as_failed_with(Some(message.clone()), details, &self.backoff)?;
            }

            let result = self
                .storage
                .record_outcome(
                    job_moves.then_some(&mut job),
                    std::slice::from_mut(&mut execution),
                )
                .await;
            match result {
                Ok(()) => {
                    if matches!(failure, Failure::Timeout { .. }) {
                        self.event_bus
                            .emit(Event::job_timed_out(job.id.clone(), execution_id.clone()))
                            .await;
                    }
                    if job_moves {
                        self.after_failure(&job, execution_id, &message).await;
                    } else {
                        tracing::debug!(job_id = %job.id, status = %job.status, "Job no longer running, status kept");
                    }
                    return Ok(execution);
                }
                Err(StorageError::VersionConflict(_)) => {
                    tracing::debug!(execution_id = %execution_id, attempt, "Concurrent update, retrying failure");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Conflict(format!(
            "execution {} kept changing during update",
            execution_id
        )))
    }

    async fn after_failure(&self, job: &Job, execution_id: &ExecutionId, message: &str) {
        if job.status != JobStatus::Retry {
            tracing::warn!(job_id = %job.id, execution_id = %execution_id, error = %message, "Job failed");
            self.event_bus
                .emit(Event::job_failed(job.id.clone(), execution_id.clone(), message))
                .await;
            return;
        }

        let next_retry_at = job.next_retry_at.unwrap_or_else(Utc::now);
        tracing::info!(
            job_id = %job.id,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            next_retry_at = %next_retry_at,
            error = %message,
            "Job failed, retry scheduled"
        );
        self.event_bus
            .emit(Event::job_retrying(
                job.id.clone(),
                job.retry_count,
                job.max_retries,
                next_retry_at,
            ))
            .await;

        if let Err(e) = self.enqueue_retry(job, next_retry_at).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to enqueue retry, job stays in retry until retried manually");
        }
    }

    /// Enqueue a delivery without an execution, due at `at`.
    async fn enqueue_retry(&self, job: &Job, at: DateTime<Utc>) -> Result<(), QueueError> {
        let delay_ms = u64::try_from((at - Utc::now()).num_milliseconds()).unwrap_or(0);
        let item = WorkItem {
            job_id: job.id.clone(),
            execution_id: None,
            payload: job.payload.clone(),
        };
        self.router
            .replace_job(
                &job.id.to_string(),
                job.job_type.as_str(),
                item.to_value(),
                route(job, delay_ms),
            )
            .await?;
        Ok(())
    }

    /// Best-effort removal of a job's broker items.
    async fn remove_deliveries(&self, job_id: &JobId) {
        if let Err(e) = self.router.remove_job(&job_id.to_string()).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove broker entry");
        }
    }
}

/// Broker routing for a job. The broker gets a single attempt; retries
/// belong to the job.
fn route(job: &Job, delay_ms: u64) -> RouteOptions {
    RouteOptions {
        id: Some(job.id.to_string()),
        priority: job.priority,
        delay_ms,
        attempts: Some(1),
        backoff_delay_ms: None,
    }
}

fn contention(job_id: &JobId) -> SchedulerError {
    SchedulerError::Conflict(format!("job {} kept changing during update", job_id))
}

fn upstream(action: &str, job_id: &JobId, err: QueueError) -> SchedulerError {
    match SchedulerError::from(err) {
        SchedulerError::Upstream(msg) => {
            SchedulerError::Upstream(format!("{} for job {}: {}", action, job_id, msg))
        }
        other => other,
    }
}
