//! Work queue (broker) abstraction.
//!
//! The engine hands dispatched jobs to a broker and workers pull them back
//! out. [`QueueBackend`] is the seam; [`InMemoryQueue`] emulates a broker
//! with priorities, delays and per-item attempts, and [`QueueRouter`] spreads
//! work over the three named queues.

mod memory;
mod router;

pub use memory::InMemoryQueue;
pub use router::{
    QueueHealth, QueueName, QueueRouter, QueueStats, QueueStatus, RouteOptions, RouterSettings,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::Add;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No item with this id.
    #[error("queue item not found: {0}")]
    NotFound(String),

    /// An active item with this id already exists.
    #[error("queue item already active: {0}")]
    Duplicate(String),

    /// The item is not in a state that allows the operation.
    #[error("queue item {id} is {state}")]
    InvalidState { id: String, state: ItemState },

    /// Unrecognized queue name.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Bad argument, such as cleaning a non-terminal state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Queue lock was poisoned.
    #[error("queue lock poisoned")]
    LockPoisoned,

    /// The broker could not be reached or refused the call.
    #[error("broker error: {0}")]
    Backend(String),
}

/// State of an item inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Waiting => "waiting",
            ItemState::Active => "active",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
            ItemState::Delayed => "delayed",
            ItemState::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Completed | ItemState::Failed)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting" => Ok(ItemState::Waiting),
            "active" => Ok(ItemState::Active),
            "completed" => Ok(ItemState::Completed),
            "failed" => Ok(ItemState::Failed),
            "delayed" => Ok(ItemState::Delayed),
            "paused" => Ok(ItemState::Paused),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown item state: {}",
                other
            ))),
        }
    }
}

/// A unit of work held by a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    /// Name of the work, e.g. the job type.
    pub name: String,
    /// Queue holding the item.
    pub queue: String,
    pub data: Value,
    pub priority: i32,
    pub state: ItemState,
    /// Deliveries allowed before the item fails for good.
    pub attempts: u32,
    pub attempts_made: u32,
    /// Base of the broker's exponential redelivery delay.
    pub backoff_delay_ms: u64,
    pub created_at: DateTime<Utc>,
    /// When a delayed item becomes deliverable.
    pub available_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

/// Options for [`QueueBackend::enqueue`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Item id; generated when absent.
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

/// Item counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }

    pub fn increment(&mut self, state: ItemState) {
        match state {
            ItemState::Waiting => self.waiting += 1,
            ItemState::Active => self.active += 1,
            ItemState::Completed => self.completed += 1,
            ItemState::Failed => self.failed += 1,
            ItemState::Delayed => self.delayed += 1,
            ItemState::Paused => self.paused += 1,
        }
    }

    /// A queue is unhealthy once failures reach `ratio` of completions.
    /// A queue with no failures is always healthy.
    pub fn is_healthy(&self, ratio: f64) -> bool {
        self.failed == 0 || (self.failed as f64) < ratio * self.completed as f64
    }
}

impl Add for QueueCounts {
    type Output = QueueCounts;

    fn add(self, rhs: QueueCounts) -> QueueCounts {
        QueueCounts {
            waiting: self.waiting + rhs.waiting,
            active: self.active + rhs.active,
            completed: self.completed + rhs.completed,
            failed: self.failed + rhs.failed,
            delayed: self.delayed + rhs.delayed,
            paused: self.paused + rhs.paused,
        }
    }
}

/// A recurrence registered with the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatableJob {
    /// Unique key; the engine uses the job id.
    pub key: String,
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub data: Value,
    pub next_run: Option<DateTime<Utc>>,
}

/// A single broker queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Name of this queue.
    fn name(&self) -> &str;

    /// Add an item. Re-enqueueing an existing non-active id replaces it.
    async fn enqueue(
        &self,
        name: &str,
        data: Value,
        options: EnqueueOptions,
    ) -> Result<QueueItem, QueueError>;

    /// Take the next deliverable item and mark it active.
    /// Returns `None` when nothing is ready or the queue is paused.
    async fn dequeue(&self) -> Result<Option<QueueItem>, QueueError>;

    /// Acknowledge an active item as done.
    async fn complete(&self, id: &str) -> Result<(), QueueError>;

    /// Report a failed delivery. Returns the item's new state: delayed when
    /// attempts remain, failed otherwise.
    async fn fail(&self, id: &str, reason: &str) -> Result<ItemState, QueueError>;

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, QueueError>;

    /// Remove an item. Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, QueueError>;

    /// Items in `state`, at most `limit`.
    async fn list(&self, state: ItemState, limit: usize) -> Result<Vec<QueueItem>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    async fn is_paused(&self) -> Result<bool, QueueError>;

    /// Drop terminal items in `state` that finished more than `older_than`
    /// ago. Returns how many were removed.
    async fn clean(&self, state: ItemState, older_than: Duration) -> Result<usize, QueueError>;

    /// Move up to `limit` failed items back to waiting.
    async fn retry_failed(&self, limit: usize) -> Result<usize, QueueError>;

    async fn add_repeatable(&self, job: RepeatableJob) -> Result<(), QueueError>;

    /// Returns whether a registration with `key` existed.
    async fn remove_repeatable(&self, key: &str) -> Result<bool, QueueError>;

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>, QueueError>;
}
