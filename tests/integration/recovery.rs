//! Restart and recovery integration tests.
//!
//! Jobs, schedules and executions live in the store, broker items do not
//! survive a restart. These tests stop an engine backed by a SQLite file,
//! start a fresh one on the same file and check that work can continue.

#![cfg(feature = "sqlite")]

use crate::common::wait_for_job_status;
use chronoq::testing::FlakyHandler;
use chronoq::{
    BackoffCalculator, ExecutionStatus, HandlerRegistry, JobStatus, JobType, NewJob,
    QueueRouter, RouterSettings, ScheduleOptions, ScheduleStatus, SchedulerEngine, SqliteStorage,
    WorkerConfig, WorkerPool,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fresh engine (and broker) over the database file.
async fn open_engine(path: &Path) -> Arc<SchedulerEngine<SqliteStorage>> {
    let storage = SqliteStorage::new(path).await.unwrap();
    Arc::new(
        SchedulerEngine::new(
            Arc::new(storage),
            Arc::new(QueueRouter::in_memory(RouterSettings::default())),
        )
        .with_backoff(BackoffCalculator::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        )),
    )
}

async fn close(engine: Arc<SchedulerEngine<SqliteStorage>>) {
    engine.storage().close().await;
}

/// Test: Jobs, schedules and execution history survive a restart.
#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("chronoq.db");

    let engine = open_engine(&db).await;
    let job = engine
        .create_job(
            NewJob::new("nightly export", JobType::DataExport)
                .payload(json!({"bucket": "exports"}))
                .priority(6)
                .max_retries(4)
                .metadata("owner", "data-team"),
        )
        .await
        .unwrap();
    let schedule = engine
        .schedule_job(
            &job.id,
            ScheduleOptions::new("30 2 * * *")
                .timezone("America/New_York")
                .max_executions(10),
        )
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();
    engine
        .complete_job_execution(&execution.id, Some(json!({"rows": 1200})))
        .await
        .unwrap();
    close(engine).await;

    let engine = open_engine(&db).await;
    let restored = engine.find_job_by_id(&job.id).await.unwrap();
    assert_eq!(restored.name, "nightly export");
    assert_eq!(restored.status, JobStatus::Completed);
    assert_eq!(restored.priority, 6);
    assert_eq!(restored.max_retries, 4);
    assert_eq!(restored.payload["bucket"], "exports");
    assert_eq!(restored.metadata["owner"], "data-team");

    let restored_schedule = engine.get_schedule(&job.id).await.unwrap();
    assert_eq!(restored_schedule.id, schedule.id);
    assert_eq!(restored_schedule.cron_expression, "30 2 * * *");
    assert_eq!(restored_schedule.timezone, "America/New_York");
    assert_eq!(restored_schedule.status, ScheduleStatus::Active);
    assert_eq!(restored_schedule.max_executions, Some(10));
    assert_eq!(restored_schedule.next_execution, schedule.next_execution);

    let history = engine.get_job_executions(&job.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Completed);
    assert_eq!(history[0].output, Some(json!({"rows": 1200})));

    // The schedule keeps firing from the restored state.
    let due = restored_schedule.next_execution.unwrap();
    assert_eq!(engine.fire_due_schedules(due).await.unwrap(), 1);
    assert_eq!(
        engine.get_schedule(&job.id).await.unwrap().execution_count,
        1
    );
    assert_eq!(
        engine.find_job_by_id(&job.id).await.unwrap().status,
        JobStatus::Running
    );
    close(engine).await;
}

/// Test: A job waiting for a retry is re-dispatched after a restart.
#[tokio::test]
async fn test_retry_continues_after_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("chronoq.db");

    let engine = open_engine(&db).await;
    let job = engine
        .create_job(NewJob::new("webhook", JobType::Webhook).max_retries(3))
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();
    engine
        .fail_job_execution(&execution.id, "connection reset", None)
        .await
        .unwrap();
    close(engine).await;

    // The new broker holds nothing; the store still says RETRY.
    let engine = open_engine(&db).await;
    let waiting = engine.find_job_by_id(&job.id).await.unwrap();
    assert_eq!(waiting.status, JobStatus::Retry);
    assert_eq!(waiting.retry_count, 1);
    assert!(
        engine
            .router()
            .get_job(&job.id.to_string())
            .await
            .unwrap()
            .is_none()
    );

    let flaky = Arc::new(FlakyHandler::new(0));
    let registry = HandlerRegistry::new().with_fallback(flaky.clone());
    let config = WorkerConfig {
        concurrency: 1,
        poll_interval: Duration::from_millis(5),
        default_timeout: Duration::from_secs(5),
        worker_id: "after-restart".into(),
    };
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), config).start();

    let retried = engine.retry_job(&job.id).await.unwrap();
    assert_eq!(retried.retry_count, 1);

    let done = wait_for_job_status(&engine, &job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    workers.shutdown().await;

    assert_eq!(done.retry_count, 1);
    assert_eq!(flaky.call_count().await, 1);
    let history = engine.get_job_executions(&job.id).await.unwrap();
    assert_eq!(history.len(), 2);
    let latest = history
        .iter()
        .find(|e| e.status == ExecutionStatus::Completed)
        .unwrap();
    assert_eq!(latest.worker_id.as_deref(), Some("after-restart"));
    assert_eq!(latest.retry_attempt, 1);
    close(engine).await;
}
