//! Job and schedule lifecycle integration tests.
//!
//! Drives the engine through complete scenarios: creation, dispatch,
//! failures with retries, cancellation, recurrence and deletion.

use crate::common::memory_engine;
use chrono::{Duration as ChronoDuration, Utc};
use chronoq::testing::EventRecorder;
use chronoq::{
    BackoffCalculator, ErrorKind, EventBus, ExecutionStatus, InMemoryStorage, ItemState,
    JobFilter, JobPatch, JobStatus, JobType, NewJob, QueueRouter, RouterSettings,
    ScheduleOptions, ScheduleStatus, SchedulerEngine, Storage, WorkItem,
};
use serde_json::json;
use std::sync::Arc;

/// Test: A created job round-trips with every field of its spec.
#[tokio::test]
async fn test_create_and_find_round_trip() {
    let engine = memory_engine();
    let spec = NewJob::new("welcome mail", JobType::Email)
        .payload(json!({"to": "new@example.com", "template": "welcome"}))
        .priority(4)
        .max_retries(5)
        .timeout_ms(30_000)
        .metadata("tenant", "acme");
    let created = engine.create_job(spec).await.unwrap();

    let found = engine.find_job_by_id(&created.id).await.unwrap();
    assert_eq!(found, created);
    assert_eq!(found.status, JobStatus::Pending);
    assert_eq!(found.retry_count, 0);
    assert_eq!(found.job_type, JobType::Email);
    assert_eq!(found.payload["template"], "welcome");
    assert_eq!(found.priority, 4);
    assert_eq!(found.max_retries, 5);
    assert_eq!(found.timeout_ms, Some(30_000));
    assert_eq!(found.metadata["tenant"], "acme");
}

/// Test: Repeated failures consume retries and end FAILED.
#[tokio::test]
async fn test_repeated_failures_exhaust_retries() {
    let engine = memory_engine();
    let job = engine
        .create_job(NewJob::new("flaky webhook", JobType::Webhook).max_retries(2))
        .await
        .unwrap();

    let mut retry_times = Vec::new();
    for attempt in 1..=3 {
        let execution = engine.execute_job(&job.id).await.unwrap();
        let failed = engine
            .fail_job_execution(&execution.id, format!("boom {}", attempt), None)
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);

        let job = engine.find_job_by_id(&job.id).await.unwrap();
        assert!(job.retry_count <= job.max_retries);
        if attempt < 3 {
            assert_eq!(job.status, JobStatus::Retry);
            assert_eq!(job.retry_count, attempt);
            retry_times.push(job.next_retry_at.unwrap());
        } else {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.retry_count, 2);
            assert!(job.next_retry_at.is_none());
            assert_eq!(job.error_message.as_deref(), Some("boom 3"));
        }
    }

    // Later attempts back off further.
    let spacing = retry_times[1] - Utc::now();
    assert!(spacing > ChronoDuration::minutes(3));
    assert!(retry_times[0] < retry_times[1]);

    let history = engine.get_job_executions(&job.id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|e| e.status == ExecutionStatus::Failed));
    let mut attempts: Vec<u32> = history.iter().map(|e| e.retry_attempt).collect();
    attempts.sort();
    assert_eq!(attempts, vec![0, 1, 2]);

    // A failed job no longer executes until requeued.
    let err = engine.execute_job(&job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let requeued = engine.requeue_job(&job.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 0);
    assert!(requeued.error_message.is_none());
    engine.execute_job(&job.id).await.unwrap();
}

/// Test: A failed execution leaves a delayed retry delivery in the broker.
#[tokio::test]
async fn test_retry_delivery_lands_in_delayed_queue() {
    let engine = memory_engine();
    let job = engine
        .create_job(NewJob::new("export", JobType::DataExport).max_retries(1))
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();
    engine
        .fail_job_execution(&execution.id, "disk full", Some(json!({"free": 0})))
        .await
        .unwrap();

    let item = engine
        .router()
        .get_job(&job.id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.queue, "delayed");
    assert_eq!(item.state, ItemState::Delayed);
    let work = WorkItem::from_value(&item.data).unwrap();
    assert_eq!(work.job_id, job.id);
    assert!(work.execution_id.is_none());

    let execution = engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(execution.error_details, Some(json!({"free": 0})));
}

/// Test: Cancelling a running job makes later reports no-ops.
#[tokio::test]
async fn test_cancel_running_job_ignores_late_completion() {
    let engine = memory_engine();
    let job = engine
        .create_job(NewJob::new("transcode", JobType::MediaProcessing))
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();

    let cancelled = engine.cancel_job(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(
        engine
            .router()
            .get_job(&job.id.to_string())
            .await
            .unwrap()
            .is_none()
    );

    let late = engine
        .complete_job_execution(&execution.id, Some(json!({"frames": 10})))
        .await
        .unwrap();
    assert_eq!(late.status, ExecutionStatus::Cancelled);
    let late = engine
        .fail_job_execution(&execution.id, "late failure", None)
        .await
        .unwrap();
    assert_eq!(late.status, ExecutionStatus::Cancelled);

    let job = engine.find_job_by_id(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.retry_count, 0);
}

/// Test: Pausing a running job lets its outcome through without moving it.
#[tokio::test]
async fn test_pause_running_job_keeps_it_paused() {
    let engine = memory_engine();
    let job = engine
        .create_job(NewJob::new("cleanup", JobType::MessageCleanup))
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();
    engine.pause_job(&job.id).await.unwrap();

    let execution = engine
        .complete_job_execution(&execution.id, None)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        engine.find_job_by_id(&job.id).await.unwrap().status,
        JobStatus::Paused
    );

    let resumed = engine.resume_job(&job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);
}

/// Test: Updating and filtering jobs.
#[tokio::test]
async fn test_update_and_list_jobs() {
    let engine = memory_engine();
    let a = engine
        .create_job(NewJob::new("a", JobType::Email))
        .await
        .unwrap();
    engine
        .create_job(NewJob::new("b", JobType::Webhook))
        .await
        .unwrap();
    engine
        .create_job(NewJob::new("c", JobType::Email))
        .await
        .unwrap();
    engine.execute_job(&a.id).await.unwrap();

    let patch = JobPatch {
        priority: Some(9),
        payload: Some(json!({"subject": "updated"})),
        ..Default::default()
    };
    let updated = engine.update_job(&a.id, patch).await.unwrap();
    assert_eq!(updated.priority, 9);
    assert_eq!(updated.status, JobStatus::Running);

    let emails = engine
        .list_jobs(&JobFilter {
            job_type: Some(JobType::Email),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(emails.len(), 2);

    let running = engine
        .list_jobs(&JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, a.id);

    let limited = engine
        .list_jobs(&JobFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    let stats = engine.get_job_statistics().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status[&JobStatus::Pending], 2);
    assert_eq!(stats.by_status[&JobStatus::Running], 1);
    assert_eq!(stats.by_status[&JobStatus::Completed], 0);
}

/// Test: Deleting a job removes its schedule, executions and deliveries.
#[tokio::test]
async fn test_delete_job_cascades() {
    let engine = memory_engine();
    let job = engine
        .create_job(NewJob::new("digest", JobType::Email))
        .await
        .unwrap();
    engine
        .schedule_job(&job.id, ScheduleOptions::new("0 8 * * *"))
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();
    assert_eq!(engine.router().repeatables().await.unwrap().len(), 1);

    engine.delete_job(&job.id).await.unwrap();

    assert_eq!(
        engine.find_job_by_id(&job.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        engine.get_schedule(&job.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        engine.get_execution(&execution.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(engine.router().repeatables().await.unwrap().is_empty());
    assert!(
        engine
            .router()
            .get_job(&job.id.to_string())
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        engine.delete_job(&job.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

/// Test: A schedule with a bad cron expression leaves nothing behind.
#[tokio::test]
async fn test_invalid_schedule_persists_nothing() {
    let engine = memory_engine();
    let job = engine
        .create_job(NewJob::new("report", JobType::DataExport))
        .await
        .unwrap();

    for cron in ["not-a-cron", "* * * *", "60 * * * *", "*/0 * * * *", "1-5 * * * *"] {
        let err = engine
            .schedule_job(&job.id, ScheduleOptions::new(cron))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "cron {:?}", cron);
    }
    let err = engine
        .schedule_job(
            &job.id,
            ScheduleOptions::new("0 * * * *").timezone("Nowhere/Special"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    assert!(engine.list_schedules().await.unwrap().is_empty());
    assert!(engine.router().repeatables().await.unwrap().is_empty());
}

/// Test: Recurring fires reset finished jobs and expire after the limit.
#[tokio::test]
async fn test_recurrence_until_expired() {
    let events = Arc::new(EventRecorder::new());
    let bus = Arc::new(EventBus::new());
    bus.register(events.clone()).await;
    let storage = Arc::new(InMemoryStorage::new());
    let engine = SchedulerEngine::new(
        Arc::clone(&storage),
        Arc::new(QueueRouter::in_memory(RouterSettings::default())),
    )
    .with_event_bus(bus)
    .with_backoff(BackoffCalculator::new(
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(10),
    ));

    let job = engine
        .create_job(NewJob::new("heartbeat", JobType::Maintenance))
        .await
        .unwrap();
    let schedule = engine
        .schedule_job(&job.id, ScheduleOptions::new("* * * * *").max_executions(2))
        .await
        .unwrap();
    let first_due = schedule.next_execution.unwrap();

    // Not due yet.
    assert_eq!(
        engine
            .fire_due_schedules(first_due - ChronoDuration::seconds(1))
            .await
            .unwrap(),
        0
    );

    // First fire dispatches the pending job.
    assert_eq!(engine.fire_due_schedules(first_due).await.unwrap(), 1);
    let executions = engine.get_job_executions(&job.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    engine
        .complete_job_execution(&executions[0].id, None)
        .await
        .unwrap();

    // Second fire resets the completed job and dispatches again.
    let second_due = engine
        .get_schedule(&job.id)
        .await
        .unwrap()
        .next_execution
        .unwrap();
    assert!(second_due > first_due);
    assert_eq!(engine.fire_due_schedules(second_due).await.unwrap(), 1);

    let schedule = engine.get_schedule(&job.id).await.unwrap();
    assert_eq!(schedule.execution_count, 2);
    assert_eq!(schedule.status, ScheduleStatus::Expired);
    assert!(!schedule.is_active);
    assert!(schedule.next_execution.is_none());
    assert!(engine.router().repeatables().await.unwrap().is_empty());
    assert_eq!(
        engine.get_job_executions(&job.id).await.unwrap().len(),
        2
    );

    // Expired schedules never fire again.
    let later = second_due + ChronoDuration::hours(1);
    assert_eq!(engine.fire_due_schedules(later).await.unwrap(), 0);

    let kinds: Vec<&str> = events
        .events()
        .await
        .iter()
        .map(|e| e.kind())
        .filter(|k| k.starts_with("schedule_"))
        .collect();
    assert_eq!(
        kinds,
        vec!["schedule_fired", "schedule_fired", "schedule_expired"]
    );
    assert_eq!(storage.list_schedules().await.unwrap().len(), 1);
}

/// Test: A fire that finds the job still running skips the occurrence.
#[tokio::test]
async fn test_recurrence_skips_busy_job() {
    let engine = memory_engine();
    let job = engine
        .create_job(NewJob::new("sync", JobType::Custom))
        .await
        .unwrap();
    engine.execute_job(&job.id).await.unwrap();
    let schedule = engine
        .schedule_job(&job.id, ScheduleOptions::new("*/5 * * * *"))
        .await
        .unwrap();
    let due = schedule.next_execution.unwrap();

    assert_eq!(engine.fire_due_schedules(due).await.unwrap(), 0);

    let after = engine.get_schedule(&job.id).await.unwrap();
    assert_eq!(after.execution_count, 0);
    assert!(after.next_execution.unwrap() > due);
    assert_eq!(engine.get_job_executions(&job.id).await.unwrap().len(), 1);
}
