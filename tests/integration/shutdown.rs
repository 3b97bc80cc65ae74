//! Graceful shutdown integration tests.
//!
//! Tests that verify the worker pool waits for running handlers before
//! exiting and that a stopped schedule runner refuses further commands.

use crate::common::{memory_engine, wait_until};
use async_trait::async_trait;
use chronoq::testing::EventRecorder;
use chronoq::{
    ErrorKind, EventBus, ExecutionStatus, HandlerError, HandlerRegistry, InMemoryStorage, Job,
    JobHandler, JobStatus, JobType, NewJob, QueueRouter, RouterSettings, ScheduleRunner,
    SchedulerEngine, SchedulerError, SchedulerState, WorkerConfig, WorkerPool,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Handler that takes a specified duration to complete.
struct SlowTask {
    duration: Duration,
    started: AtomicBool,
    completed: AtomicBool,
}

impl SlowTask {
    fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        })
    }

    fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn was_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SlowTask {
    async fn execute(&self, _job: &Job) -> Result<Option<Value>, HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.completed.store(true, Ordering::SeqCst);
        Ok(None)
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        poll_interval: Duration::from_millis(5),
        default_timeout: Duration::from_secs(5),
        worker_id: "shutdown-test".into(),
    }
}

/// Test: Graceful shutdown waits for running handlers to complete.
///
/// Shutdown is triggered while a handler is mid-flight; the pool must not
/// return until that handler finished and its outcome was recorded.
#[tokio::test]
async fn test_graceful_shutdown_waits_for_handlers() {
    let recorder = Arc::new(EventRecorder::new());
    let bus = Arc::new(EventBus::new());
    bus.register(recorder.clone()).await;
    let engine = Arc::new(
        SchedulerEngine::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(QueueRouter::in_memory(RouterSettings::default())),
        )
        .with_event_bus(bus),
    );

    let slow = SlowTask::new(Duration::from_millis(300));
    let registry = HandlerRegistry::new().with_fallback(slow.clone());
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), config()).start();

    let job = engine
        .create_job(NewJob::new("slow", JobType::MediaProcessing))
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();

    let task = Arc::clone(&slow);
    assert!(
        wait_until(Duration::from_secs(2), || {
            let task = Arc::clone(&task);
            async move { task.was_started() }
        })
        .await,
        "Handler should have started"
    );
    assert!(!slow.was_completed(), "Handler should not have completed yet");

    let shutdown_start = std::time::Instant::now();
    workers.shutdown().await;
    let shutdown_duration = shutdown_start.elapsed();

    assert!(
        slow.was_completed(),
        "Handler should have completed during graceful shutdown"
    );
    assert!(
        shutdown_duration >= Duration::from_millis(150),
        "Shutdown should have waited for the handler. Duration: {:?}",
        shutdown_duration
    );

    let execution = engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        engine.find_job_by_id(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert!(recorder.kinds().await.contains(&"job_completed"));
}

/// Test: Work enqueued after shutdown stays in the broker.
#[tokio::test]
async fn test_no_deliveries_after_shutdown() {
    let engine = memory_engine();
    let slow = SlowTask::new(Duration::from_millis(1));
    let registry = HandlerRegistry::new().with_fallback(slow.clone());
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), config()).start();
    workers.shutdown().await;

    let job = engine
        .create_job(NewJob::new("late", JobType::Custom))
        .await
        .unwrap();
    engine.execute_job(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!slow.was_started());
    assert_eq!(
        engine.find_job_by_id(&job.id).await.unwrap().status,
        JobStatus::Running
    );
    assert!(
        engine
            .router()
            .get_job(&job.id.to_string())
            .await
            .unwrap()
            .is_some()
    );
}

/// Test: A stopped schedule runner rejects commands.
#[tokio::test]
async fn test_runner_shutdown() {
    let engine = memory_engine();
    let (handle, task) = ScheduleRunner::new(engine)
        .with_tick_interval(Duration::from_millis(20))
        .start();
    assert_eq!(handle.state().await, SchedulerState::Running);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("runner task should finish")
        .unwrap();

    assert_eq!(handle.state().await, SchedulerState::Stopped);
    let err = handle.pause().await.unwrap_err();
    assert!(matches!(err, SchedulerError::ChannelError(_)));
    let err = handle.fire_now().await.unwrap_err();
    assert!(matches!(err, SchedulerError::ChannelError(_)));
    assert_eq!(err.kind(), ErrorKind::Internal);
}
