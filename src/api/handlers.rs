//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::execution::JobExecution;
use crate::core::job::{Job, JobFilter, JobPatch, JobStatus, JobType, NewJob};
use crate::core::schedule::{JobSchedule, ScheduleOptions};
use crate::core::types::{ExecutionId, JobId};
use crate::queue::{ItemState, QueueHealth, QueueItem, QueueStats, RouteOptions};
use crate::scheduler::{JobStatistics, SchedulerEngine, SchedulerHandle};
use crate::storage::Storage;

use super::errors::ApiError;
use super::responses::{
    CleanResponse, ExecuteResponse, ExecutionListResponse, HealthResponse, JobListResponse,
    MessageResponse, QueueControlResponse, QueueItemListResponse, RetryFailedResponse,
    ScheduleListResponse, SchedulerStateResponse, TickResponse,
};

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub engine: Arc<SchedulerEngine<S>>,
    /// Absent when no schedule runner is attached.
    pub handle: Option<SchedulerHandle>,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            handle: self.handle.clone(),
        }
    }
}

impl<S: Storage> ApiState<S> {
    fn handle(&self) -> Result<&SchedulerHandle, ApiError> {
        self.handle
            .as_ref()
            .ok_or_else(|| ApiError::ServiceUnavailable("schedule runner is not attached".into()))
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::from_str(raw).map_err(|_| ApiError::InvalidArgument(format!("invalid job id: {}", raw)))
}

fn parse_execution_id(raw: &str) -> Result<ExecutionId, ApiError> {
    ExecutionId::from_str(raw)
        .map_err(|_| ApiError::InvalidArgument(format!("invalid execution id: {}", raw)))
}

/// Query parameters for list_jobs endpoint.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    fn into_filter(self) -> Result<JobFilter, ApiError> {
        let status = self
            .status
            .as_deref()
            .map(JobStatus::from_str)
            .transpose()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
        let job_type = self
            .job_type
            .as_deref()
            .map(JobType::from_str)
            .transpose()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
        Ok(JobFilter {
            status,
            job_type,
            limit: self.limit,
        })
    }
}

/// Query parameters for list_executions endpoint.
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// Query parameters for listing broker items.
#[derive(Debug, Deserialize)]
pub struct QueueItemsQuery {
    pub state: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// Body for adding a raw broker item.
#[derive(Debug, Deserialize)]
pub struct AddQueueItemRequest {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub options: RouteOptions,
}

/// Body for cleaning terminal broker items.
#[derive(Debug, Deserialize)]
pub struct CleanRequest {
    pub state: String,
    /// Grace period; items that finished more recently are kept.
    #[serde(default, alias = "olderThanMs")]
    pub older_than_ms: u64,
}

/// Body for retrying failed broker items.
#[derive(Debug, Deserialize)]
pub struct RetryFailedRequest {
    #[serde(default = "default_retry_limit")]
    pub limit: usize,
}

fn default_retry_limit() -> usize {
    100
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

// Schedule runner

/// Get scheduler state.
pub async fn get_scheduler_state<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<SchedulerStateResponse>, ApiError> {
    let scheduler_state = state.handle()?.state().await;
    Ok(Json(SchedulerStateResponse::from(scheduler_state)))
}

/// Pause the scheduler.
pub async fn pause_scheduler<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle()?.pause().await?;
    Ok(Json(MessageResponse::new("scheduler paused")))
}

/// Resume the scheduler.
pub async fn resume_scheduler<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle()?.resume().await?;
    Ok(Json(MessageResponse::new("scheduler resumed")))
}

/// Fire due schedules now.
pub async fn tick_scheduler<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<TickResponse>, ApiError> {
    let fired = state.handle()?.fire_now().await?;
    Ok(Json(TickResponse { fired }))
}

// Jobs

/// Create a job.
pub async fn create_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(spec): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.engine.create_job(spec).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// List jobs matching the query filter.
pub async fn list_jobs<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = query.into_filter()?;
    let jobs = state.engine.list_jobs(&filter).await?;
    Ok(Json(JobListResponse::from(jobs)))
}

/// Get a specific job.
pub async fn get_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.find_job_by_id(&job_id).await?))
}

/// Patch a job's mutable fields.
pub async fn update_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.update_job(&job_id, patch).await?))
}

/// Delete a job with its schedule and executions.
pub async fn delete_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.engine.delete_job(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Dispatch a job now.
pub async fn execute_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let execution = state.engine.execute_job(&job_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecuteResponse {
            job_id: job_id.to_string(),
            execution,
            message: format!("job '{}' dispatched", job_id),
        }),
    ))
}

/// List executions for a job, most recent first.
pub async fn list_executions<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ExecutionListResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let executions = state.engine.get_job_history(&job_id, query.limit).await?;
    Ok(Json(ExecutionListResponse::from(executions)))
}

/// Get a specific execution.
pub async fn get_execution<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(execution_id): Path<String>,
) -> Result<Json<JobExecution>, ApiError> {
    let execution_id = parse_execution_id(&execution_id)?;
    Ok(Json(state.engine.get_execution(&execution_id).await?))
}

/// Job counts by status.
pub async fn job_statistics<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<JobStatistics>, ApiError> {
    Ok(Json(state.engine.get_job_statistics().await?))
}

pub async fn pause_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.pause_job(&job_id).await?))
}

pub async fn resume_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.resume_job(&job_id).await?))
}

pub async fn cancel_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.cancel_job(&job_id).await?))
}

pub async fn retry_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.retry_job(&job_id).await?))
}

pub async fn requeue_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.requeue_job(&job_id).await?))
}

// Schedules

/// Attach or replace a job's schedule.
pub async fn schedule_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
    Json(options): Json<ScheduleOptions>,
) -> Result<(StatusCode, Json<JobSchedule>), ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let schedule = state.engine.schedule_job(&job_id, options).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn get_schedule<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSchedule>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.get_schedule(&job_id).await?))
}

pub async fn list_schedules<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<ScheduleListResponse>, ApiError> {
    let schedules = state.engine.list_schedules().await?;
    Ok(Json(ScheduleListResponse::from(schedules)))
}

pub async fn pause_schedule<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSchedule>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.pause_schedule(&job_id).await?))
}

pub async fn resume_schedule<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSchedule>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.resume_schedule(&job_id).await?))
}

pub async fn deactivate_schedule<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSchedule>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.engine.deactivate_schedule(&job_id).await?))
}

pub async fn unschedule_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.engine.unschedule_job(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Queue administration

pub async fn queue_stats<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.engine.router().get_queue_stats().await?))
}

/// Queue health. Answers 503 when any queue is unhealthy.
pub async fn queue_health<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<(StatusCode, Json<QueueHealth>), ApiError> {
    let health = state.engine.router().get_queue_health().await?;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(health)))
}

/// List broker items in a state across all queues.
pub async fn list_queue_items<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<QueueItemsQuery>,
) -> Result<Json<QueueItemListResponse>, ApiError> {
    let item_state = ItemState::from_str(&query.state)?;
    let items = state
        .engine
        .router()
        .list_jobs(item_state, query.limit)
        .await?;
    Ok(Json(QueueItemListResponse::from(items)))
}

/// Add a raw broker item.
pub async fn add_queue_item<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<AddQueueItemRequest>,
) -> Result<(StatusCode, Json<QueueItem>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::InvalidArgument("item name cannot be empty".into()));
    }
    let item = state
        .engine
        .router()
        .add_job(&request.name, request.data, request.options)
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn get_queue_item<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(item_id): Path<String>,
) -> Result<Json<QueueItem>, ApiError> {
    state
        .engine
        .router()
        .get_job(&item_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("queue item not found: {}", item_id)))
}

pub async fn remove_queue_item<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(item_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.router().remove_job(&item_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("queue item not found: {}", item_id)))
    }
}

pub async fn pause_queue<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(queue): Path<String>,
) -> Result<Json<QueueControlResponse>, ApiError> {
    let queue = state.engine.router().pause_queue(&queue).await?;
    Ok(Json(QueueControlResponse {
        queue,
        paused: true,
    }))
}

pub async fn resume_queue<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(queue): Path<String>,
) -> Result<Json<QueueControlResponse>, ApiError> {
    let queue = state.engine.router().resume_queue(&queue).await?;
    Ok(Json(QueueControlResponse {
        queue,
        paused: false,
    }))
}

/// Drop old completed or failed items.
pub async fn clean_queues<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<CleanRequest>,
) -> Result<Json<CleanResponse>, ApiError> {
    let item_state = ItemState::from_str(&request.state)?;
    let removed = state
        .engine
        .router()
        .clean_queue(item_state, Duration::from_millis(request.older_than_ms))
        .await?;
    Ok(Json(CleanResponse { removed }))
}

pub async fn retry_failed<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<RetryFailedRequest>,
) -> Result<Json<RetryFailedResponse>, ApiError> {
    let retried = state
        .engine
        .router()
        .retry_failed_jobs(request.limit)
        .await?;
    Ok(Json(RetryFailedResponse { retried }))
}
