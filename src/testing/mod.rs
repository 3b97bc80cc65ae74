//! Testing utilities for users of the chronoq library.
//!
//! This module provides helpers for testing job handlers and engine wiring:
//!
//! - [`FlakyHandler`]: A handler that fails N times then succeeds
//! - [`RecordingHandler`]: A handler that records the jobs it ran
//! - [`SlowHandler`]: A handler that sleeps, for timeout tests
//! - [`EventRecorder`]: An event handler that keeps every event
//! - [`FailingQueue`]: A broker queue whose writes can be made to fail
//! - [`TestHarness`]: An in-memory engine plus a worker you drive by hand

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::job::{Job, JobType};
use crate::core::types::JobId;
use crate::events::{Event, EventHandler};
use crate::execution::{
    DeliveryOutcome, HandlerError, HandlerRegistry, JobHandler, WorkerConfig, WorkerPool,
};
use crate::queue::{
    EnqueueOptions, InMemoryQueue, ItemState, QueueBackend, QueueCounts, QueueError, QueueItem,
    QueueRouter, RepeatableJob, RouterSettings,
};
use crate::scheduler::SchedulerEngine;
use crate::storage::InMemoryStorage;

/// A handler that fails a set number of times then succeeds.
///
/// Useful for exercising retry and backoff paths.
///
/// # Example
///
/// ```
/// use chronoq::testing::FlakyHandler;
///
/// // Fails twice, then succeeds on the third call
/// let handler = FlakyHandler::new(2);
/// ```
pub struct FlakyHandler {
    /// Mutex protecting failure state under concurrent execution.
    state: Mutex<FlakyState>,
    error_message: String,
}

struct FlakyState {
    failures_remaining: u32,
    call_count: u32,
}

impl FlakyHandler {
    /// Create a handler that fails `fail_count` times then succeeds.
    pub fn new(fail_count: u32) -> Self {
        Self::with_error(fail_count, "intentional test failure")
    }

    /// Create a handler that fails with a custom error message.
    pub fn with_error(fail_count: u32, message: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(FlakyState {
                failures_remaining: fail_count,
                call_count: 0,
            }),
            error_message: message.into(),
        }
    }

    pub async fn failures_remaining(&self) -> u32 {
        self.state.lock().await.failures_remaining
    }

    pub async fn call_count(&self) -> u32 {
        self.state.lock().await.call_count
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn execute(&self, _job: &Job) -> Result<Option<Value>, HandlerError> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(HandlerError::Failed(self.error_message.clone()));
        }
        Ok(Some(json!({ "attempt": state.call_count })))
    }
}

/// A handler that succeeds and remembers every job it ran.
#[derive(Default)]
pub struct RecordingHandler {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots of the jobs run so far, in order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().await.clone()
    }

    pub async fn job_ids(&self) -> Vec<JobId> {
        self.jobs.lock().await.iter().map(|j| j.id.clone()).collect()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn execute(&self, job: &Job) -> Result<Option<Value>, HandlerError> {
        self.jobs.lock().await.push(job.clone());
        Ok(Some(json!({ "handled": job.id.to_string() })))
    }
}

/// A handler that sleeps before succeeding.
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn execute(&self, _job: &Job) -> Result<Option<Value>, HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }
}

/// An event handler that keeps every event it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Event kinds in emission order, e.g. `["job_created", "job_started"]`.
    pub async fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(Event::kind).collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// An in-memory broker queue whose enqueue and remove calls can be switched
/// to fail with [`QueueError::Backend`]. Reads always work.
pub struct FailingQueue {
    inner: InMemoryQueue,
    fail_enqueue: AtomicBool,
    fail_remove: AtomicBool,
}

impl FailingQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: InMemoryQueue::new(name),
            fail_enqueue: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
        }
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), QueueError> {
        if flag.load(Ordering::SeqCst) {
            return Err(QueueError::Backend(format!(
                "{} unavailable on {}",
                op,
                self.inner.name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for FailingQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn enqueue(
        &self,
        name: &str,
        data: Value,
        options: EnqueueOptions,
    ) -> Result<QueueItem, QueueError> {
        self.check(&self.fail_enqueue, "enqueue")?;
        self.inner.enqueue(name, data, options).await
    }

    async fn dequeue(&self) -> Result<Option<QueueItem>, QueueError> {
        self.inner.dequeue().await
    }

    async fn complete(&self, id: &str) -> Result<(), QueueError> {
        self.inner.complete(id).await
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<ItemState, QueueError> {
        self.inner.fail(id, reason).await
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        self.inner.get(id).await
    }

    async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        self.check(&self.fail_remove, "remove")?;
        self.inner.remove(id).await
    }

    async fn list(&self, state: ItemState, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        self.inner.list(state, limit).await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.inner.counts().await
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.inner.pause().await
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.inner.resume().await
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        self.inner.is_paused().await
    }

    async fn clean(&self, state: ItemState, older_than: Duration) -> Result<usize, QueueError> {
        self.inner.clean(state, older_than).await
    }

    async fn retry_failed(&self, limit: usize) -> Result<usize, QueueError> {
        self.inner.retry_failed(limit).await
    }

    async fn add_repeatable(&self, job: RepeatableJob) -> Result<(), QueueError> {
        self.check(&self.fail_enqueue, "add_repeatable")?;
        self.inner.add_repeatable(job).await
    }

    async fn remove_repeatable(&self, key: &str) -> Result<bool, QueueError> {
        self.check(&self.fail_remove, "remove_repeatable")?;
        self.inner.remove_repeatable(key).await
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>, QueueError> {
        self.inner.repeatables().await
    }
}

/// An in-memory engine with a worker driven by hand.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use chronoq::testing::{RecordingHandler, TestHarness};
/// use chronoq::{JobType, NewJob};
///
/// # tokio_test_block(async {
/// let recorder = Arc::new(RecordingHandler::new());
/// let harness = TestHarness::new().with_handler(JobType::Email, recorder.clone());
///
/// let job = harness.engine().create_job(NewJob::new("mail", JobType::Email)).await.unwrap();
/// harness.engine().execute_job(&job.id).await.unwrap();
/// harness.run_until_idle().await;
///
/// assert_eq!(recorder.job_ids().await, vec![job.id]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct TestHarness {
    engine: Arc<SchedulerEngine<InMemoryStorage>>,
    registry: HandlerRegistry,
    config: WorkerConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(RouterSettings::default())
    }

    pub fn with_settings(settings: RouterSettings) -> Self {
        let engine = SchedulerEngine::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(QueueRouter::in_memory(settings)),
        );
        Self {
            engine: Arc::new(engine),
            registry: HandlerRegistry::new(),
            config: WorkerConfig {
                worker_id: "test-harness".into(),
                ..WorkerConfig::default()
            },
        }
    }

    pub fn with_handler(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.registry = self.registry.register(job_type, handler);
        self
    }

    pub fn with_fallback(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.registry = self.registry.with_fallback(handler);
        self
    }

    /// Handler timeout for jobs without their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine<InMemoryStorage>> {
        &self.engine
    }

    /// Process deliveries until none is ready. Delayed retries that are not
    /// due yet stay in the broker.
    pub async fn run_until_idle(&self) -> Vec<DeliveryOutcome> {
        let pool = WorkerPool::new(
            Arc::clone(&self.engine),
            Arc::new(self.registry.clone()),
            self.config.clone(),
        );
        let mut outcomes = Vec::new();
        while let Some(outcome) = pool.run_once().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
