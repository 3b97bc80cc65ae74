//! Lifecycle events and event handling.
//!
//! The engine emits an [`Event`] for every job and schedule transition so
//! that logging, metrics or notification layers can observe it without
//! touching engine code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::core::job::JobType;
use crate::core::types::{ExecutionId, JobId, ScheduleId};

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job was created.
    JobCreated {
        job_id: JobId,
        job_type: JobType,
        timestamp: Instant,
    },

    /// A job was dispatched and an execution started.
    JobStarted {
        job_id: JobId,
        execution_id: ExecutionId,
        timestamp: Instant,
    },

    /// An execution finished successfully.
    JobCompleted {
        job_id: JobId,
        execution_id: ExecutionId,
        duration_ms: u64,
        timestamp: Instant,
    },

    /// An execution failed and the job has no retries left.
    JobFailed {
        job_id: JobId,
        execution_id: ExecutionId,
        error: String,
        timestamp: Instant,
    },

    /// An execution failed and the job will be retried.
    JobRetrying {
        job_id: JobId,
        /// The retry about to be scheduled (1-indexed).
        attempt: u32,
        max_retries: u32,
        next_retry_at: DateTime<Utc>,
        timestamp: Instant,
    },

    /// A handler exceeded its timeout.
    JobTimedOut {
        job_id: JobId,
        execution_id: ExecutionId,
        timestamp: Instant,
    },

    JobCancelled {
        job_id: JobId,
        timestamp: Instant,
    },

    JobPaused {
        job_id: JobId,
        timestamp: Instant,
    },

    JobResumed {
        job_id: JobId,
        timestamp: Instant,
    },

    JobDeleted {
        job_id: JobId,
        timestamp: Instant,
    },

    /// A schedule occurrence dispatched its job.
    ScheduleFired {
        job_id: JobId,
        schedule_id: ScheduleId,
        execution_count: u64,
        timestamp: Instant,
    },

    /// A schedule reached its execution cap.
    ScheduleExpired {
        job_id: JobId,
        schedule_id: ScheduleId,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobCreated { timestamp, .. }
            | Event::JobStarted { timestamp, .. }
            | Event::JobCompleted { timestamp, .. }
            | Event::JobFailed { timestamp, .. }
            | Event::JobRetrying { timestamp, .. }
            | Event::JobTimedOut { timestamp, .. }
            | Event::JobCancelled { timestamp, .. }
            | Event::JobPaused { timestamp, .. }
            | Event::JobResumed { timestamp, .. }
            | Event::JobDeleted { timestamp, .. }
            | Event::ScheduleFired { timestamp, .. }
            | Event::ScheduleExpired { timestamp, .. } => *timestamp,
        }
    }

    /// The job the event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::JobCreated { job_id, .. }
            | Event::JobStarted { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobRetrying { job_id, .. }
            | Event::JobTimedOut { job_id, .. }
            | Event::JobCancelled { job_id, .. }
            | Event::JobPaused { job_id, .. }
            | Event::JobResumed { job_id, .. }
            | Event::JobDeleted { job_id, .. }
            | Event::ScheduleFired { job_id, .. }
            | Event::ScheduleExpired { job_id, .. } => job_id,
        }
    }

    /// Short name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::JobCreated { .. } => "job_created",
            Event::JobStarted { .. } => "job_started",
            Event::JobCompleted { .. } => "job_completed",
            Event::JobFailed { .. } => "job_failed",
            Event::JobRetrying { .. } => "job_retrying",
            Event::JobTimedOut { .. } => "job_timed_out",
            Event::JobCancelled { .. } => "job_cancelled",
            Event::JobPaused { .. } => "job_paused",
            Event::JobResumed { .. } => "job_resumed",
            Event::JobDeleted { .. } => "job_deleted",
            Event::ScheduleFired { .. } => "schedule_fired",
            Event::ScheduleExpired { .. } => "schedule_expired",
        }
    }

    pub fn job_created(job_id: JobId, job_type: JobType) -> Self {
        Event::JobCreated {
            job_id,
            job_type,
            timestamp: Instant::now(),
        }
    }

    pub fn job_started(job_id: JobId, execution_id: ExecutionId) -> Self {
        Event::JobStarted {
            job_id,
            execution_id,
            timestamp: Instant::now(),
        }
    }

    pub fn job_completed(job_id: JobId, execution_id: ExecutionId, duration_ms: u64) -> Self {
        Event::JobCompleted {
            job_id,
            execution_id,
            duration_ms,
            timestamp: Instant::now(),
        }
    }

    pub fn job_failed(job_id: JobId, execution_id: ExecutionId, error: impl Into<String>) -> Self {
        Event::JobFailed {
            job_id,
            execution_id,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn job_retrying(
        job_id: JobId,
        attempt: u32,
        max_retries: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Self {
        Event::JobRetrying {
            job_id,
            attempt,
            max_retries,
            next_retry_at,
            timestamp: Instant::now(),
        }
    }

    pub fn job_timed_out(job_id: JobId, execution_id: ExecutionId) -> Self {
        Event::JobTimedOut {
            job_id,
            execution_id,
            timestamp: Instant::now(),
        }
    }

    pub fn job_cancelled(job_id: JobId) -> Self {
        Event::JobCancelled {
            job_id,
            timestamp: Instant::now(),
        }
    }

    pub fn job_paused(job_id: JobId) -> Self {
        Event::JobPaused {
            job_id,
            timestamp: Instant::now(),
        }
    }

    pub fn job_resumed(job_id: JobId) -> Self {
        Event::JobResumed {
            job_id,
            timestamp: Instant::now(),
        }
    }

    pub fn job_deleted(job_id: JobId) -> Self {
        Event::JobDeleted {
            job_id,
            timestamp: Instant::now(),
        }
    }

    pub fn schedule_fired(job_id: JobId, schedule_id: ScheduleId, execution_count: u64) -> Self {
        Event::ScheduleFired {
            job_id,
            schedule_id,
            execution_count,
            timestamp: Instant::now(),
        }
    }

    pub fn schedule_expired(job_id: JobId, schedule_id: ScheduleId) -> Self {
        Event::ScheduleExpired {
            job_id,
            schedule_id,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes every event to the tracing log.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobFailed { job_id, error, .. } => {
                tracing::warn!(job_id = %job_id, error = %error, "Job failed");
            }
            Event::JobTimedOut {
                job_id,
                execution_id,
                ..
            } => {
                tracing::warn!(job_id = %job_id, execution_id = %execution_id, "Job timed out");
            }
            Event::JobRetrying {
                job_id,
                attempt,
                max_retries,
                next_retry_at,
                ..
            } => {
                tracing::info!(
                    job_id = %job_id,
                    attempt,
                    max_retries,
                    next_retry_at = %next_retry_at,
                    "Job scheduled for retry"
                );
            }
            other => {
                tracing::info!(job_id = %other.job_id(), event = other.kind(), "Job event");
            }
        }
    }
}
