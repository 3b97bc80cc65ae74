//! Execution records: one per attempt to run a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use super::job::Job;
use super::types::{ExecutionId, JobId};

/// Status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one attempt to run a job.
///
/// Created RUNNING at dispatch, then moved to exactly one terminal status.
/// Transition methods return `false` and change nothing once the record is
/// terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at - started_at`, set once on the terminal transition.
    pub duration_ms: Option<u64>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    /// Retries consumed by the job when this attempt started.
    pub retry_attempt: u32,
    pub worker_id: Option<String>,
    pub queue_name: Option<String>,
    pub execution_context: HashMap<String, Value>,
    pub priority: i32,
    pub version: u64,
}

impl JobExecution {
    /// Start a RUNNING execution for `job`.
    pub fn start(job: &Job) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id: job.id.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            output: None,
            error_message: None,
            error_details: None,
            retry_attempt: job.retry_count,
            worker_id: None,
            queue_name: None,
            execution_context: HashMap::new(),
            priority: job.priority,
            version: 0,
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.execution_context.insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn complete(&mut self, output: Option<Value>) -> bool {
        if !self.finish(ExecutionStatus::Completed) {
            return false;
        }
        self.output = output;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>, details: Option<Value>) -> bool {
        if !self.finish(ExecutionStatus::Failed) {
            return false;
        }
        self.error_message = Some(error.into());
        self.error_details = details;
        true
    }

    pub fn time_out(&mut self, error: impl Into<String>) -> bool {
        if !self.finish(ExecutionStatus::Timeout) {
            return false;
        }
        self.error_message = Some(error.into());
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.finish(ExecutionStatus::Cancelled)
    }

    fn finish(&mut self, status: ExecutionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        let now = Utc::now().max(self.started_at);
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        true
    }
}
