//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chronoq::{
    InMemoryStorage, Job, JobId, JobStatus, QueueRouter, RouterSettings, SchedulerEngine, Storage,
};
use std::sync::Arc;
use std::time::Duration;

/// In-memory engine with default routing.
pub fn memory_engine() -> Arc<SchedulerEngine<InMemoryStorage>> {
    Arc::new(SchedulerEngine::new(
        Arc::new(InMemoryStorage::new()),
        Arc::new(QueueRouter::in_memory(RouterSettings::default())),
    ))
}

/// Wait for a job to reach an expected status, polling storage.
///
/// This is more reliable than fixed sleeps since execution time can vary.
/// Polls every 10ms and times out after the specified duration.
///
/// # Panics
///
/// Panics if the timeout is reached before the job reaches the expected status.
pub async fn wait_for_job_status<S: Storage + 'static>(
    engine: &SchedulerEngine<S>,
    job_id: &JobId,
    expected: JobStatus,
    timeout: Duration,
) -> Job {
    let start = tokio::time::Instant::now();
    loop {
        let job = engine.find_job_by_id(job_id).await.unwrap();
        if job.status == expected {
            return job;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {} to reach {:?}, current status: {:?}",
                job_id, expected, job.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `check` until it returns true or the timeout passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() <= timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
