//! HTTP API module for the chronoq engine.
//!
//! Provides REST endpoints for managing jobs and schedules, dispatching work,
//! administering the broker queues and controlling the schedule runner.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::ApiState;
pub use responses::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::scheduler::{SchedulerEngine, SchedulerHandle};
use crate::storage::Storage;

/// Build the API router with all endpoints.
pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Schedule runner control
        .route(
            "/api/scheduler/state",
            get(handlers::get_scheduler_state::<S>),
        )
        .route("/api/scheduler/pause", post(handlers::pause_scheduler::<S>))
        .route(
            "/api/scheduler/resume",
            post(handlers::resume_scheduler::<S>),
        )
        .route("/api/scheduler/tick", post(handlers::tick_scheduler::<S>))
        // Jobs
        .route(
            "/api/jobs",
            get(handlers::list_jobs::<S>).post(handlers::create_job::<S>),
        )
        .route(
            "/api/jobs/{job_id}",
            get(handlers::get_job::<S>)
                .patch(handlers::update_job::<S>)
                .delete(handlers::delete_job::<S>),
        )
        .route(
            "/api/jobs/{job_id}/execute",
            post(handlers::execute_job::<S>),
        )
        .route(
            "/api/jobs/{job_id}/executions",
            get(handlers::list_executions::<S>),
        )
        .route("/api/jobs/{job_id}/pause", post(handlers::pause_job::<S>))
        .route("/api/jobs/{job_id}/resume", post(handlers::resume_job::<S>))
        .route("/api/jobs/{job_id}/cancel", post(handlers::cancel_job::<S>))
        .route("/api/jobs/{job_id}/retry", post(handlers::retry_job::<S>))
        .route(
            "/api/jobs/{job_id}/requeue",
            post(handlers::requeue_job::<S>),
        )
        .route("/api/statistics", get(handlers::job_statistics::<S>))
        .route(
            "/api/executions/{execution_id}",
            get(handlers::get_execution::<S>),
        )
        // Schedules
        .route("/api/schedules", get(handlers::list_schedules::<S>))
        .route(
            "/api/jobs/{job_id}/schedule",
            get(handlers::get_schedule::<S>)
                .put(handlers::schedule_job::<S>)
                .delete(handlers::unschedule_job::<S>),
        )
        .route(
            "/api/jobs/{job_id}/schedule/pause",
            post(handlers::pause_schedule::<S>),
        )
        .route(
            "/api/jobs/{job_id}/schedule/resume",
            post(handlers::resume_schedule::<S>),
        )
        .route(
            "/api/jobs/{job_id}/schedule/deactivate",
            post(handlers::deactivate_schedule::<S>),
        )
        // Queue administration
        .route("/api/queues/stats", get(handlers::queue_stats::<S>))
        .route("/api/queues/health", get(handlers::queue_health::<S>))
        .route(
            "/api/queues/items",
            get(handlers::list_queue_items::<S>).post(handlers::add_queue_item::<S>),
        )
        .route(
            "/api/queues/items/{item_id}",
            get(handlers::get_queue_item::<S>).delete(handlers::remove_queue_item::<S>),
        )
        .route("/api/queues/clean", post(handlers::clean_queues::<S>))
        .route(
            "/api/queues/retry-failed",
            post(handlers::retry_failed::<S>),
        )
        .route(
            "/api/queues/{queue}/pause",
            post(handlers::pause_queue::<S>),
        )
        .route(
            "/api/queues/{queue}/resume",
            post(handlers::resume_queue::<S>),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from engine components.
pub fn create_api_state<S: Storage>(
    engine: Arc<SchedulerEngine<S>>,
    handle: Option<SchedulerHandle>,
) -> ApiState<S> {
    ApiState { engine, handle }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: Storage + 'static>(
    config: &ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);
    let listener = TcpListener::bind(config.bind_address()).await?;
    let addr = listener.local_addr()?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
