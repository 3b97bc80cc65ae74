//! Worker pool consuming broker deliveries.
//!
//! The pool dequeues through the router (priority, then default, then
//! delayed), runs the handler registered for the job's type under the job's
//! timeout, acknowledges the broker item and then reports the outcome to the
//! engine. Concurrency is bounded by a semaphore.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::core::types::ExecutionId;
use crate::queue::QueueItem;
use crate::scheduler::{SchedulerEngine, SchedulerError, WorkItem};
use crate::storage::Storage;

use super::handler::{HandlerError, HandlerRegistry};

/// Worker pool tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of handlers running at once.
    pub concurrency: usize,
    /// Sleep between polls when the broker has nothing ready.
    #[serde(with = "crate::core::backoff::serde_millis")]
    pub poll_interval: Duration,
    /// Handler timeout for jobs that set none.
    #[serde(with = "crate::core::backoff::serde_millis")]
    pub default_timeout: Duration,
    /// Recorded on executions this pool claims.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            default_timeout: Duration::from_secs(300),
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Completed(ExecutionId),
    Failed(ExecutionId),
    TimedOut(ExecutionId),
    /// Not run: the job or execution was no longer runnable.
    Skipped,
    /// Not run: the item was not a job delivery or the engine refused it.
    Rejected(String),
}

struct Worker<S: Storage> {
    engine: Arc<SchedulerEngine<S>>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

/// Pool of workers running job handlers.
pub struct WorkerPool<S: Storage> {
    worker: Arc<Worker<S>>,
    semaphore: Arc<Semaphore>,
}

/// Handle to a started [`WorkerPool`].
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerPoolHandle {
    /// Stop polling and wait for running handlers to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Worker pool task ended abnormally");
        }
    }
}

impl<S: Storage + 'static> WorkerPool<S> {
    pub fn new(
        engine: Arc<SchedulerEngine<S>>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            worker: Arc::new(Worker {
                engine,
                registry,
                config,
            }),
            semaphore,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.worker.config
    }

    /// Number of free handler slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take one delivery and process it inline.
    /// Returns `None` when nothing was ready.
    pub async fn run_once(&self) -> Option<DeliveryOutcome> {
        match self.worker.engine.router().dequeue().await {
            Ok(Some(item)) => Some(self.worker.process(item).await),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to dequeue work");
                None
            }
        }
    }

    /// Spawn the polling loop.
    pub fn start(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerPoolHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let concurrency = self.worker.config.concurrency.max(1);
        tracing::info!(
            concurrency,
            worker_id = %self.worker.config.worker_id,
            "Worker pool started"
        );

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            match self.worker.engine.router().dequeue().await {
                Ok(Some(item)) => {
                    let worker = Arc::clone(&self.worker);
                    tokio::spawn(async move {
                        worker.process(item).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to dequeue work");
                    drop(permit);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.worker.config.poll_interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        // Every permit back means every handler returned.
        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _ = self.semaphore.acquire_many(permits).await;
        tracing::info!("Worker pool stopped");
    }
}

impl<S: Storage + 'static> Worker<S> {
    async fn process(&self, item: QueueItem) -> DeliveryOutcome {
        let work = match WorkItem::from_value(&item.data) {
            Ok(work) => work,
            Err(e) => {
                let reason = format!("not a job delivery: {}", e);
                tracing::warn!(item_id = %item.id, queue = %item.queue, error = %e, "Rejecting work item");
                self.ack_fail(&item, &reason).await;
                return DeliveryOutcome::Rejected(reason);
            }
        };
        let engine = &self.engine;

        let execution_id = match work.execution_id {
            Some(id) => match engine.get_execution(&id).await {
                Ok(execution) if !execution.is_terminal() => id,
                Ok(execution) => {
                    tracing::debug!(job_id = %work.job_id, execution_id = %id, status = %execution.status, "Execution already finished, dropping delivery");
                    self.ack_complete(&item).await;
                    return DeliveryOutcome::Skipped;
                }
                Err(e) => return self.reject(&item, e).await,
            },
            None => {
                match engine
                    .claim_job(&work.job_id, &item.queue, &self.config.worker_id)
                    .await
                {
                    Ok(Some(execution)) => execution.id,
                    Ok(None) => {
                        self.ack_complete(&item).await;
                        return DeliveryOutcome::Skipped;
                    }
                    Err(e) => return self.reject(&item, e).await,
                }
            }
        };

        let job = match engine.find_job_by_id(&work.job_id).await {
            Ok(job) => job,
            Err(e) => return self.reject(&item, e).await,
        };

        let Some(handler) = self.registry.get(job.job_type) else {
            let err = HandlerError::Unsupported(job.job_type);
            tracing::warn!(job_id = %job.id, job_type = %job.job_type, "No handler registered");
            self.ack_fail(&item, &err.to_string()).await;
            self.report(engine.fail_job_execution(&execution_id, err.to_string(), None).await);
            return DeliveryOutcome::Failed(execution_id);
        };

        let timeout = job
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);
        tracing::debug!(job_id = %job.id, execution_id = %execution_id, timeout_ms = timeout.as_millis() as u64, "Running handler");

        match tokio::time::timeout(timeout, handler.execute(&job)).await {
            Ok(Ok(output)) => {
                self.ack_complete(&item).await;
                self.report(engine.complete_job_execution(&execution_id, output).await);
                DeliveryOutcome::Completed(execution_id)
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                self.ack_fail(&item, &message).await;
                self.report(
                    engine
                        .fail_job_execution(&execution_id, message, err.details())
                        .await,
                );
                DeliveryOutcome::Failed(execution_id)
            }
            Err(_) => {
                tracing::warn!(job_id = %job.id, execution_id = %execution_id, timeout_ms = timeout.as_millis() as u64, "Handler timed out");
                self.ack_fail(&item, "handler timed out").await;
                self.report(engine.timeout_job_execution(&execution_id, timeout).await);
                DeliveryOutcome::TimedOut(execution_id)
            }
        }
    }

    async fn reject(&self, item: &QueueItem, err: SchedulerError) -> DeliveryOutcome {
        tracing::warn!(item_id = %item.id, error = %err, "Failed to start delivery");
        let reason = err.to_string();
        self.ack_fail(item, &reason).await;
        DeliveryOutcome::Rejected(reason)
    }

    async fn ack_complete(&self, item: &QueueItem) {
        if let Err(e) = self.engine.router().complete(item).await {
            tracing::warn!(item_id = %item.id, queue = %item.queue, error = %e, "Failed to acknowledge work item");
        }
    }

    async fn ack_fail(&self, item: &QueueItem, reason: &str) {
        if let Err(e) = self.engine.router().fail(item, reason).await {
            tracing::warn!(item_id = %item.id, queue = %item.queue, error = %e, "Failed to report work item failure");
        }
    }

    fn report<T>(&self, result: Result<T, SchedulerError>) {
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to record execution outcome");
        }
    }
}
