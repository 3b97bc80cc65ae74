//! Broker routing and queue administration tests.
//!
//! Exercises the router through the engine: where dispatched work lands,
//! how the worker drains the queues, and the operator controls.

use crate::common::memory_engine;
use chronoq::testing::{FailingQueue, FlakyHandler, RecordingHandler, TestHarness};
use chronoq::{
    DeliveryOutcome, ErrorKind, InMemoryQueue, InMemoryStorage, ItemState, JobStatus, JobType,
    NewJob, QueueName, QueueRouter, RouteOptions, RouterSettings, SchedulerEngine,
    SchedulerError, WorkItem,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Test: Dispatch routes by priority, retries go to the delayed queue.
#[tokio::test]
async fn test_dispatch_routing() {
    let engine = memory_engine();
    let low = engine
        .create_job(NewJob::new("low", JobType::Email).priority(4))
        .await
        .unwrap();
    let high = engine
        .create_job(NewJob::new("high", JobType::Email).priority(5))
        .await
        .unwrap();

    let low_exec = engine.execute_job(&low.id).await.unwrap();
    let high_exec = engine.execute_job(&high.id).await.unwrap();
    assert_eq!(low_exec.queue_name.as_deref(), Some("scheduler"));
    assert_eq!(high_exec.queue_name.as_deref(), Some("priority"));

    let router = engine.router();
    let low_item = router.get_job(&low.id.to_string()).await.unwrap().unwrap();
    let high_item = router.get_job(&high.id.to_string()).await.unwrap().unwrap();
    assert_eq!(low_item.queue, "scheduler");
    assert_eq!(high_item.queue, "priority");
    assert_eq!(high_item.attempts, 1);

    // A high-priority retry still goes to the priority queue.
    engine
        .fail_job_execution(&high_exec.id, "boom", None)
        .await
        .unwrap();
    let retry = router.get_job(&high.id.to_string()).await.unwrap().unwrap();
    assert_eq!(retry.queue, "priority");
    assert_eq!(retry.state, ItemState::Delayed);

    engine
        .fail_job_execution(&low_exec.id, "boom", None)
        .await
        .unwrap();
    let retry = router.get_job(&low.id.to_string()).await.unwrap().unwrap();
    assert_eq!(retry.queue, "delayed");
}

/// Test: Raw router selection follows priority, then delay, then default.
#[tokio::test]
async fn test_router_precedence_and_defaults() {
    let router = QueueRouter::in_memory(RouterSettings::default());

    let both = router
        .add_job(
            "mixed",
            json!({}),
            RouteOptions {
                priority: 7,
                delay_ms: 60_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(both.queue, "priority");
    assert_eq!(both.state, ItemState::Delayed);
    assert_eq!(both.attempts, 3);
    assert_eq!(both.backoff_delay_ms, 2000);

    let delayed = router
        .add_job(
            "later",
            json!({}),
            RouteOptions {
                delay_ms: 60_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(delayed.queue, "delayed");

    let plain = router
        .add_job(
            "now",
            json!({}),
            RouteOptions {
                attempts: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(plain.queue, "scheduler");
    assert_eq!(plain.attempts, 5);

    // Only the plain item is deliverable right now.
    let next = router.dequeue().await.unwrap().unwrap();
    assert_eq!(next.id, plain.id);
    assert!(router.dequeue().await.unwrap().is_none());
}

/// Test: Workers drain the priority queue before the default queue.
#[tokio::test]
async fn test_worker_drains_priority_first() {
    let recorder = Arc::new(RecordingHandler::new());
    let harness = TestHarness::new().with_fallback(recorder.clone());
    let engine = harness.engine();

    let mut expected = Vec::new();
    let first = engine
        .create_job(NewJob::new("first", JobType::Custom))
        .await
        .unwrap();
    let urgent = engine
        .create_job(NewJob::new("urgent", JobType::Custom).priority(10))
        .await
        .unwrap();
    engine.execute_job(&first.id).await.unwrap();
    engine.execute_job(&urgent.id).await.unwrap();
    expected.push(urgent.id.clone());
    expected.push(first.id.clone());

    let outcomes = harness.run_until_idle().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(recorder.job_ids().await, expected);
}

/// Test: Pausing one named queue holds only that queue's work.
#[tokio::test]
async fn test_pause_and_resume_named_queue() {
    let recorder = Arc::new(RecordingHandler::new());
    let harness = TestHarness::new().with_fallback(recorder.clone());
    let engine = harness.engine();

    let normal = engine
        .create_job(NewJob::new("normal", JobType::Custom))
        .await
        .unwrap();
    let urgent = engine
        .create_job(NewJob::new("urgent", JobType::Custom).priority(9))
        .await
        .unwrap();
    engine.execute_job(&normal.id).await.unwrap();
    engine.execute_job(&urgent.id).await.unwrap();

    let paused = engine.router().pause_queue("priority").await.unwrap();
    assert_eq!(paused, QueueName::Priority);

    harness.run_until_idle().await;
    assert_eq!(recorder.job_ids().await, vec![normal.id.clone()]);
    assert_eq!(
        engine.find_job_by_id(&urgent.id).await.unwrap().status,
        JobStatus::Running
    );

    let health = engine.router().get_queue_health().await.unwrap();
    assert!(health.total.paused);
    let priority = health
        .queues
        .iter()
        .find(|q| q.name == "priority")
        .unwrap();
    assert!(priority.paused);
    assert!(!health.queues.iter().find(|q| q.name == "scheduler").unwrap().paused);

    engine.router().resume_queue("priority").await.unwrap();
    harness.run_until_idle().await;
    assert_eq!(
        engine.find_job_by_id(&urgent.id).await.unwrap().status,
        JobStatus::Completed
    );
}

/// Test: Unknown queue names are rejected as invalid arguments.
#[tokio::test]
async fn test_unknown_queue_name() {
    let engine = memory_engine();
    for name in ["fast", "Priority", ""] {
        let err = engine.router().pause_queue(name).await.unwrap_err();
        assert_eq!(SchedulerError::from(err).kind(), ErrorKind::InvalidArgument);
    }
    let err = engine.router().resume_queue("slow").await.unwrap_err();
    assert!(err.to_string().contains("unknown queue"));
}

/// Test: Health flips once failures reach the configured share of completions.
#[tokio::test]
async fn test_queue_health_boundary() {
    let harness = TestHarness::new().with_fallback(Arc::new(FlakyHandler::new(0)));
    let engine = harness.engine();

    for i in 0..10 {
        let job = engine
            .create_job(NewJob::new(format!("ok-{}", i), JobType::Custom))
            .await
            .unwrap();
        engine.execute_job(&job.id).await.unwrap();
    }
    harness.run_until_idle().await;
    assert!(engine.router().get_queue_health().await.unwrap().healthy);

    // One failure against ten completions sits exactly on the 0.1 ratio.
    let bad = engine
        .create_job(NewJob::new("bad", JobType::Webhook).max_retries(0))
        .await
        .unwrap();
    engine.execute_job(&bad.id).await.unwrap();
    let item = engine.router().dequeue().await.unwrap().unwrap();
    engine.router().fail(&item, "handler missing").await.unwrap();

    let health = engine.router().get_queue_health().await.unwrap();
    assert_eq!(health.total.counts.completed, 10);
    assert_eq!(health.total.counts.failed, 1);
    assert!(!health.total.healthy);
    assert!(!health.healthy);

    let stats = engine.router().get_queue_stats().await.unwrap();
    assert_eq!(stats.total.completed, 10);
    assert_eq!(stats.queues["scheduler"].failed, 1);
}

/// Test: Failed deliveries can be retried and old terminal items cleaned.
#[tokio::test]
async fn test_retry_failed_and_clean() {
    let router = QueueRouter::in_memory(RouterSettings::default());
    for i in 0..3 {
        router
            .add_job(
                "raw",
                json!({"n": i}),
                RouteOptions {
                    attempts: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    for _ in 0..3 {
        let item = router.dequeue().await.unwrap().unwrap();
        router.fail(&item, "nope").await.unwrap();
    }
    assert_eq!(router.list_jobs(ItemState::Failed, 10).await.unwrap().len(), 3);

    assert_eq!(router.retry_failed_jobs(2).await.unwrap(), 2);
    assert_eq!(router.list_jobs(ItemState::Failed, 10).await.unwrap().len(), 1);
    assert_eq!(router.list_jobs(ItemState::Waiting, 10).await.unwrap().len(), 2);

    // Nothing is old enough yet.
    assert_eq!(
        router
            .clean_queue(ItemState::Failed, Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        router
            .clean_queue(ItemState::Failed, Duration::ZERO)
            .await
            .unwrap(),
        1
    );
    assert!(router.list_jobs(ItemState::Failed, 10).await.unwrap().is_empty());

    let err = router
        .clean_queue(ItemState::Waiting, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(SchedulerError::from(err).kind(), ErrorKind::InvalidArgument);
}

/// Test: A broker outage during dispatch rolls the job back.
#[tokio::test]
async fn test_broker_outage_rolls_back_dispatch() {
    let failing = Arc::new(FailingQueue::new(QueueName::Default.as_str()));
    let router = QueueRouter::new(
        failing.clone(),
        Arc::new(InMemoryQueue::new(QueueName::Priority.as_str())),
        Arc::new(InMemoryQueue::new(QueueName::Delayed.as_str())),
        RouterSettings::default(),
    );
    let engine = SchedulerEngine::new(Arc::new(InMemoryStorage::new()), Arc::new(router));
    let job = engine
        .create_job(NewJob::new("report", JobType::DataExport))
        .await
        .unwrap();

    failing.fail_enqueue(true);
    let err = engine.execute_job(&job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upstream);

    let job = engine.find_job_by_id(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    let executions = engine.get_job_executions(&job.id).await.unwrap();
    assert!(executions.iter().all(|e| e.is_terminal()));

    failing.fail_enqueue(false);
    let execution = engine.execute_job(&job.id).await.unwrap();
    let item = engine
        .router()
        .get_job(&job.id.to_string())
        .await
        .unwrap()
        .unwrap();
    let work = WorkItem::from_value(&item.data).unwrap();
    assert_eq!(work.execution_id, Some(execution.id));
}

/// Test: Items that are not job deliveries are rejected by workers.
#[tokio::test]
async fn test_foreign_items_are_rejected() {
    let harness = TestHarness::new();
    let router = harness.engine().router();
    router
        .add_job(
            "legacy",
            json!({"hello": "world"}),
            RouteOptions {
                attempts: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcomes = harness.run_until_idle().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], DeliveryOutcome::Rejected(_)));

    let failed = router.list_jobs(ItemState::Failed, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(
        failed[0]
            .failed_reason
            .as_deref()
            .unwrap()
            .contains("not a job delivery")
    );
}
