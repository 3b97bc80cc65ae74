//! Worker pool integration tests.
//!
//! Runs a started pool against a live engine: deliveries are picked up,
//! retries come back through the delayed queue, timeouts are enforced and
//! concurrency is bounded.

use crate::common::{wait_for_job_status, wait_until};
use async_trait::async_trait;
use chronoq::testing::{FlakyHandler, RecordingHandler, SlowHandler};
use chronoq::{
    BackoffCalculator, ExecutionStatus, HandlerError, HandlerRegistry, InMemoryStorage, Job,
    JobHandler, JobStatus, JobType, NewJob, QueueRouter, RouterSettings, SchedulerEngine,
    WorkerConfig, WorkerPool,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Engine whose retries come due within milliseconds.
fn quick_retry_engine() -> Arc<SchedulerEngine<InMemoryStorage>> {
    Arc::new(
        SchedulerEngine::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(QueueRouter::in_memory(RouterSettings::default())),
        )
        .with_backoff(BackoffCalculator::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        )),
    )
}

fn worker_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        concurrency,
        poll_interval: Duration::from_millis(5),
        default_timeout: Duration::from_secs(5),
        worker_id: "it-worker".into(),
    }
}

/// Tracks how many handlers run at the same time.
struct GaugeHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl GaugeHandler {
    fn new(hold: Duration) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold,
        }
    }
}

#[async_trait]
impl JobHandler for GaugeHandler {
    async fn execute(&self, _job: &Job) -> Result<Option<Value>, HandlerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// Test: A flaky handler succeeds after its retries come back around.
#[tokio::test]
async fn test_retries_until_success() {
    let engine = quick_retry_engine();
    let flaky = Arc::new(FlakyHandler::with_error(2, "upstream 503"));
    let registry = HandlerRegistry::new().register(JobType::Webhook, flaky.clone());
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), worker_config(2)).start();

    let job = engine
        .create_job(NewJob::new("hook", JobType::Webhook).max_retries(3))
        .await
        .unwrap();
    engine.execute_job(&job.id).await.unwrap();

    let done = wait_for_job_status(&engine, &job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    workers.shutdown().await;

    assert_eq!(done.retry_count, 2);
    assert_eq!(flaky.call_count().await, 3);

    let executions = engine.get_job_executions(&job.id).await.unwrap();
    assert_eq!(executions.len(), 3);
    let completed: Vec<_> = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].output, Some(json!({"attempt": 3})));
    assert_eq!(completed[0].retry_attempt, 2);
    assert_eq!(completed[0].worker_id.as_deref(), Some("it-worker"));
    assert_eq!(
        executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count(),
        2
    );
}

/// Test: A handler that keeps failing leaves the job FAILED.
#[tokio::test]
async fn test_retries_exhausted() {
    let engine = quick_retry_engine();
    let flaky = Arc::new(FlakyHandler::with_error(10, "still broken"));
    let registry = HandlerRegistry::new().with_fallback(flaky.clone());
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), worker_config(1)).start();

    let job = engine
        .create_job(NewJob::new("export", JobType::DataExport).max_retries(2))
        .await
        .unwrap();
    engine.execute_job(&job.id).await.unwrap();

    let failed = wait_for_job_status(&engine, &job.id, JobStatus::Failed, Duration::from_secs(5)).await;
    workers.shutdown().await;

    assert_eq!(failed.retry_count, 2);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("execution failed: still broken")
    );
    assert_eq!(flaky.call_count().await, 3);
    assert_eq!(engine.get_job_executions(&job.id).await.unwrap().len(), 3);
}

/// Test: Handlers running past the job timeout are recorded as timeouts.
#[tokio::test]
async fn test_handler_timeout() {
    let engine = quick_retry_engine();
    let slow = Arc::new(SlowHandler::new(Duration::from_millis(500)));
    let registry = HandlerRegistry::new().register(JobType::MediaProcessing, slow);
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), worker_config(1)).start();

    let job = engine
        .create_job(
            NewJob::new("transcode", JobType::MediaProcessing)
                .timeout_ms(20)
                .max_retries(0),
        )
        .await
        .unwrap();
    let execution = engine.execute_job(&job.id).await.unwrap();

    let failed = wait_for_job_status(&engine, &job.id, JobStatus::Failed, Duration::from_secs(5)).await;
    workers.shutdown().await;

    assert!(failed.error_message.unwrap().contains("timed out"));
    let execution = engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
}

/// Test: The pool never runs more handlers than its concurrency.
#[tokio::test]
async fn test_concurrency_is_bounded() {
    let engine = quick_retry_engine();
    let gauge = Arc::new(GaugeHandler::new(Duration::from_millis(30)));
    let registry = HandlerRegistry::new().with_fallback(gauge.clone());
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), worker_config(3)).start();

    for i in 0..9 {
        let job = engine
            .create_job(NewJob::new(format!("job-{}", i), JobType::Custom))
            .await
            .unwrap();
        engine.execute_job(&job.id).await.unwrap();
    }

    let check = Arc::clone(&engine);
    let all_done = wait_until(Duration::from_secs(5), || {
        let engine = Arc::clone(&check);
        async move {
            engine.get_job_statistics().await.unwrap().by_status[&JobStatus::Completed] == 9
        }
    })
    .await;
    workers.shutdown().await;

    assert!(all_done);
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {}", peak);
    assert!(peak >= 2, "handlers never overlapped");
}

/// Test: Each job type goes to its own handler.
#[tokio::test]
async fn test_handlers_by_job_type() {
    let engine = quick_retry_engine();
    let mail = Arc::new(RecordingHandler::new());
    let hooks = Arc::new(RecordingHandler::new());
    let registry = HandlerRegistry::new()
        .register(JobType::Email, mail.clone())
        .register(JobType::Webhook, hooks.clone());
    let workers = WorkerPool::new(Arc::clone(&engine), Arc::new(registry), worker_config(2)).start();

    let email = engine
        .create_job(NewJob::new("mail", JobType::Email))
        .await
        .unwrap();
    let hook = engine
        .create_job(NewJob::new("hook", JobType::Webhook))
        .await
        .unwrap();
    let orphan = engine
        .create_job(NewJob::new("push", JobType::PushNotification).max_retries(0))
        .await
        .unwrap();
    for id in [&email.id, &hook.id, &orphan.id] {
        engine.execute_job(id).await.unwrap();
    }

    wait_for_job_status(&engine, &email.id, JobStatus::Completed, Duration::from_secs(5)).await;
    wait_for_job_status(&engine, &hook.id, JobStatus::Completed, Duration::from_secs(5)).await;
    let orphan = wait_for_job_status(&engine, &orphan.id, JobStatus::Failed, Duration::from_secs(5)).await;
    workers.shutdown().await;

    assert_eq!(mail.job_ids().await, vec![email.id]);
    assert_eq!(hooks.job_ids().await, vec![hook.id]);
    assert!(
        orphan
            .error_message
            .unwrap()
            .contains("no handler registered")
    );
}
