//! API response types.

use serde::Serialize;

use crate::core::execution::JobExecution;
use crate::core::job::Job;
use crate::core::schedule::JobSchedule;
use crate::queue::{QueueItem, QueueName};
use crate::scheduler::SchedulerState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Scheduler state response.
#[derive(Debug, Serialize)]
pub struct SchedulerStateResponse {
    pub state: String,
    pub is_running: bool,
    pub is_paused: bool,
}

impl From<SchedulerState> for SchedulerStateResponse {
    fn from(state: SchedulerState) -> Self {
        Self {
            state: format!("{:?}", state).to_lowercase(),
            is_running: state == SchedulerState::Running,
            is_paused: state == SchedulerState::Paused,
        }
    }
}

/// Result of a manual schedule tick.
#[derive(Debug, Serialize)]
pub struct TickResponse {
    pub fired: usize,
}

/// List of jobs response.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
}

impl From<Vec<Job>> for JobListResponse {
    fn from(jobs: Vec<Job>) -> Self {
        let count = jobs.len();
        Self { jobs, count }
    }
}

/// List of schedules response.
#[derive(Debug, Serialize)]
pub struct ScheduleListResponse {
    pub schedules: Vec<JobSchedule>,
    pub count: usize,
}

impl From<Vec<JobSchedule>> for ScheduleListResponse {
    fn from(schedules: Vec<JobSchedule>) -> Self {
        let count = schedules.len();
        Self { schedules, count }
    }
}

/// Execute-now response.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub job_id: String,
    pub execution: JobExecution,
    pub message: String,
}

/// List of executions response, most recent first.
#[derive(Debug, Serialize)]
pub struct ExecutionListResponse {
    pub executions: Vec<JobExecution>,
    pub count: usize,
}

impl From<Vec<JobExecution>> for ExecutionListResponse {
    fn from(executions: Vec<JobExecution>) -> Self {
        let count = executions.len();
        Self { executions, count }
    }
}

/// List of broker items response.
#[derive(Debug, Serialize)]
pub struct QueueItemListResponse {
    pub items: Vec<QueueItem>,
    pub count: usize,
}

impl From<Vec<QueueItem>> for QueueItemListResponse {
    fn from(items: Vec<QueueItem>) -> Self {
        let count = items.len();
        Self { items, count }
    }
}

/// Pause or resume of a named queue.
#[derive(Debug, Serialize)]
pub struct QueueControlResponse {
    pub queue: QueueName,
    pub paused: bool,
}

/// Items removed by a clean.
#[derive(Debug, Serialize)]
pub struct CleanResponse {
    pub removed: usize,
}

/// Failed items moved back to waiting.
#[derive(Debug, Serialize)]
pub struct RetryFailedResponse {
    pub retried: usize,
}

/// Simple message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
