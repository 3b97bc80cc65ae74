//! Routing over the three named queues.
//!
//! Work goes to the `priority` queue when its priority reaches the high
//! threshold, else to `delayed` when it carries a delay, else to the default
//! `scheduler` queue. Lookups and removals check every queue since an item id
//! is unique across all of them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{
    EnqueueOptions, InMemoryQueue, ItemState, QueueBackend, QueueCounts, QueueError, QueueItem,
    RepeatableJob,
};

/// The three logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "scheduler")]
    Default,
    #[serde(rename = "priority")]
    Priority,
    #[serde(rename = "delayed")]
    Delayed,
}

impl QueueName {
    /// Search order for lookups and removals.
    pub const ALL: [QueueName; 3] = [QueueName::Default, QueueName::Priority, QueueName::Delayed];

    /// Order in which workers drain the queues.
    pub const DEQUEUE_ORDER: [QueueName; 3] =
        [QueueName::Priority, QueueName::Default, QueueName::Delayed];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Default => "scheduler",
            QueueName::Priority => "priority",
            QueueName::Delayed => "delayed",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|name| name.as_str() == s.trim())
            .ok_or_else(|| QueueError::UnknownQueue(s.to_string()))
    }
}

/// Routing hints for a unit of work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteOptions {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff_delay_ms: Option<u64>,
}

/// Router tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSettings {
    /// `priority >= threshold` selects the priority queue.
    pub high_priority_threshold: i32,
    /// Broker attempts when the caller gives none.
    pub default_attempts: u32,
    /// Broker backoff base when the caller gives none.
    pub backoff_delay_ms: u64,
    /// Failure to completion ratio at which a queue turns unhealthy.
    pub unhealthy_failure_ratio: f64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            high_priority_threshold: 5,
            default_attempts: 3,
            backoff_delay_ms: 2000,
            unhealthy_failure_ratio: 0.1,
        }
    }
}

/// Per-queue and aggregated counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Keyed by queue name.
    pub queues: BTreeMap<String, QueueCounts>,
    pub total: QueueCounts,
}

/// Health of one queue or of the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub healthy: bool,
    pub paused: bool,
    pub counts: QueueCounts,
}

/// Health report across all queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealth {
    /// False if the aggregate or any single queue is unhealthy.
    pub healthy: bool,
    pub total: QueueStatus,
    pub queues: Vec<QueueStatus>,
}

/// Routes work over the default, priority and delayed queues.
pub struct QueueRouter {
    default: Arc<dyn QueueBackend>,
    priority: Arc<dyn QueueBackend>,
    delayed: Arc<dyn QueueBackend>,
    settings: RouterSettings,
}

impl QueueRouter {
    pub fn new(
        default: Arc<dyn QueueBackend>,
        priority: Arc<dyn QueueBackend>,
        delayed: Arc<dyn QueueBackend>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            default,
            priority,
            delayed,
            settings,
        }
    }

    /// Router over three fresh in-memory queues.
    pub fn in_memory(settings: RouterSettings) -> Self {
        Self::new(
            Arc::new(InMemoryQueue::new(QueueName::Default.as_str())),
            Arc::new(InMemoryQueue::new(QueueName::Priority.as_str())),
            Arc::new(InMemoryQueue::new(QueueName::Delayed.as_str())),
            settings,
        )
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn queue(&self, name: QueueName) -> &Arc<dyn QueueBackend> {
        match name {
            QueueName::Default => &self.default,
            QueueName::Priority => &self.priority,
            QueueName::Delayed => &self.delayed,
        }
    }

    /// Priority wins over delay.
    pub fn select_queue(&self, options: &RouteOptions) -> QueueName {
        if options.priority >= self.settings.high_priority_threshold {
            QueueName::Priority
        } else if options.delay_ms > 0 {
            QueueName::Delayed
        } else {
            QueueName::Default
        }
    }

    /// Route and enqueue, filling in attempts and backoff defaults.
    pub async fn add_job(
        &self,
        name: &str,
        data: Value,
        options: RouteOptions,
    ) -> Result<QueueItem, QueueError> {
        let target = self.select_queue(&options);
        let enqueue = self.enqueue_options(options);
        let item = self.queue(target).enqueue(name, data, enqueue).await?;
        tracing::debug!(item_id = %item.id, queue = %target, "Enqueued work item");
        Ok(item)
    }

    /// Enqueue under a fixed id, then drop copies of that id held by the
    /// other queues. The old entries stay in place if the enqueue fails.
    ///
    /// A stale ACTIVE entry in the target queue is replaced.
    pub async fn replace_job(
        &self,
        id: &str,
        name: &str,
        data: Value,
        mut options: RouteOptions,
    ) -> Result<QueueItem, QueueError> {
        options.id = Some(id.to_string());
        let target = self.select_queue(&options);
        let queue = self.queue(target);

        let enqueue = self.enqueue_options(options);
        let item = match queue.enqueue(name, data.clone(), enqueue.clone()).await {
            Err(QueueError::Duplicate(_)) => {
                queue.remove(id).await?;
                queue.enqueue(name, data, enqueue).await?
            }
            other => other?,
        };

        for other in QueueName::ALL.into_iter().filter(|n| *n != target) {
            if let Err(e) = self.queue(other).remove(id).await {
                tracing::warn!(item_id = %id, queue = %other, error = %e, "Failed to remove replaced work item");
            }
        }
        tracing::debug!(item_id = %item.id, queue = %target, "Replaced work item");
        Ok(item)
    }

    fn enqueue_options(&self, options: RouteOptions) -> EnqueueOptions {
        EnqueueOptions {
            id: options.id,
            priority: options.priority,
            delay_ms: options.delay_ms,
            attempts: Some(options.attempts.unwrap_or(self.settings.default_attempts)),
            backoff_delay_ms: Some(
                options
                    .backoff_delay_ms
                    .unwrap_or(self.settings.backoff_delay_ms),
            ),
        }
    }

    /// Find an item in whichever queue holds it.
    pub async fn get_job(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        for name in QueueName::ALL {
            if let Some(item) = self.queue(name).get(id).await? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Remove an item from every queue. Fails only if every queue failed.
    pub async fn remove_job(&self, id: &str) -> Result<bool, QueueError> {
        let mut removed = false;
        let mut last_error = None;
        let mut failures = 0;
        for name in QueueName::ALL {
            match self.queue(name).remove(id).await {
                Ok(hit) => removed |= hit,
                Err(e) => {
                    tracing::warn!(item_id = %id, queue = %name, error = %e, "Failed to remove work item");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if failures == QueueName::ALL.len() => Err(e),
            _ => Ok(removed),
        }
    }

    /// Next deliverable item, draining priority before default before delayed.
    pub async fn dequeue(&self) -> Result<Option<QueueItem>, QueueError> {
        for name in QueueName::DEQUEUE_ORDER {
            if let Some(item) = self.queue(name).dequeue().await? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Acknowledge an item in the queue it came from.
    pub async fn complete(&self, item: &QueueItem) -> Result<(), QueueError> {
        self.queue(item.queue.parse()?).complete(&item.id).await
    }

    /// Report a failed delivery to the queue it came from.
    pub async fn fail(&self, item: &QueueItem, reason: &str) -> Result<ItemState, QueueError> {
        self.queue(item.queue.parse()?).fail(&item.id, reason).await
    }

    /// Items in `state` across all queues, at most `limit`.
    pub async fn list_jobs(&self, state: ItemState, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let mut items = Vec::new();
        for name in QueueName::ALL {
            if items.len() >= limit {
                break;
            }
            items.extend(self.queue(name).list(state, limit - items.len()).await?);
        }
        Ok(items)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let mut queues = BTreeMap::new();
        let mut total = QueueCounts::default();
        for name in QueueName::ALL {
            let counts = self.queue(name).counts().await?;
            total = total + counts;
            queues.insert(name.to_string(), counts);
        }
        Ok(QueueStats { queues, total })
    }

    pub async fn get_queue_health(&self) -> Result<QueueHealth, QueueError> {
        let ratio = self.settings.unhealthy_failure_ratio;
        let mut queues = Vec::with_capacity(QueueName::ALL.len());
        let mut total = QueueCounts::default();
        let mut any_paused = false;

        for name in QueueName::ALL {
            let backend = self.queue(name);
            let counts = backend.counts().await?;
            let paused = backend.is_paused().await?;
            total = total + counts;
            any_paused |= paused;
            queues.push(QueueStatus {
                name: name.to_string(),
                healthy: counts.is_healthy(ratio),
                paused,
                counts,
            });
        }

        let total = QueueStatus {
            name: "total".to_string(),
            healthy: total.is_healthy(ratio),
            paused: any_paused,
            counts: total,
        };
        let healthy = total.healthy && queues.iter().all(|q| q.healthy);
        Ok(QueueHealth {
            healthy,
            total,
            queues,
        })
    }

    /// Pause exactly the named queue.
    pub async fn pause_queue(&self, name: &str) -> Result<QueueName, QueueError> {
        let name: QueueName = name.parse()?;
        self.queue(name).pause().await?;
        tracing::info!(queue = %name, "Queue paused");
        Ok(name)
    }

    /// Resume exactly the named queue.
    pub async fn resume_queue(&self, name: &str) -> Result<QueueName, QueueError> {
        let name: QueueName = name.parse()?;
        self.queue(name).resume().await?;
        tracing::info!(queue = %name, "Queue resumed");
        Ok(name)
    }

    /// Drop old terminal items from every queue. A failing queue is logged
    /// and skipped.
    pub async fn clean_queue(&self, state: ItemState, older_than: Duration) -> Result<usize, QueueError> {
        if !state.is_terminal() {
            return Err(QueueError::InvalidArgument(format!(
                "can only clean completed or failed items, not {}",
                state
            )));
        }
        let mut cleaned = 0;
        for name in QueueName::ALL {
            match self.queue(name).clean(state, older_than).await {
                Ok(n) => cleaned += n,
                Err(e) => {
                    tracing::warn!(queue = %name, error = %e, "Failed to clean queue");
                }
            }
        }
        Ok(cleaned)
    }

    /// Move up to `limit` failed items back to waiting across all queues.
    pub async fn retry_failed_jobs(&self, limit: usize) -> Result<usize, QueueError> {
        let mut retried = 0;
        for name in QueueName::ALL {
            if retried >= limit {
                break;
            }
            retried += self.queue(name).retry_failed(limit - retried).await?;
        }
        Ok(retried)
    }

    /// Register a recurrence on the queue its priority routes to.
    pub async fn add_repeatable(&self, job: RepeatableJob, priority: i32) -> Result<QueueName, QueueError> {
        let target = self.select_queue(&RouteOptions {
            priority,
            ..Default::default()
        });
        self.queue(target).add_repeatable(job).await?;
        Ok(target)
    }

    /// Drop a recurrence from every queue. Returns whether any held it.
    pub async fn remove_repeatable(&self, key: &str) -> Result<bool, QueueError> {
        let mut removed = false;
        for name in QueueName::ALL {
            removed |= self.queue(name).remove_repeatable(key).await?;
        }
        Ok(removed)
    }

    pub async fn repeatables(&self) -> Result<Vec<RepeatableJob>, QueueError> {
        let mut all = Vec::new();
        for name in QueueName::ALL {
            all.extend(self.queue(name).repeatables().await?);
        }
        Ok(all)
    }
}
