//! In-memory broker.
//!
//! Emulates the delivery semantics the engine relies on: higher priority
//! first, FIFO within a priority, delayed items promoted once due, per-item
//! attempts with exponential redelivery, and pause.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use super::{
    EnqueueOptions, ItemState, QueueBackend, QueueCounts, QueueError, QueueItem, RepeatableJob,
};

struct Entry {
    item: QueueItem,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    items: HashMap<String, Entry>,
    next_seq: u64,
    paused: bool,
    repeatables: BTreeMap<String, RepeatableJob>,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn promote_due(&mut self) {
        let now = Utc::now();
        for entry in self.items.values_mut() {
            if entry.item.state == ItemState::Delayed && entry.item.available_at <= now {
                entry.item.state = ItemState::Waiting;
            }
        }
    }

    /// Waiting items are reported as paused while the queue is paused.
    fn view(&self, entry: &Entry) -> QueueItem {
        let mut item = entry.item.clone();
        if self.paused && item.state == ItemState::Waiting {
            item.state = ItemState::Paused;
        }
        item
    }

    fn active_mut(&mut self, id: &str) -> Result<&mut QueueItem, QueueError> {
        let entry = self
            .items
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if entry.item.state != ItemState::Active {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                state: entry.item.state,
            });
        }
        Ok(&mut entry.item)
    }
}

/// In-memory broker queue.
///
/// Thread-safe queue using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryQueue {
    name: String,
    state: RwLock<QueueState>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
        }
    }
}

fn backoff(base_ms: u64, attempts_made: u32) -> chrono::Duration {
    let factor = 2u64.saturating_pow(attempts_made.saturating_sub(1));
    let millis = base_ms.saturating_mul(factor).min(i64::MAX as u64) as i64;
    chrono::Duration::try_milliseconds(millis).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        name: &str,
        data: Value,
        options: EnqueueOptions,
    ) -> Result<QueueItem, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let id = options
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if state
            .items
            .get(&id)
            .is_some_and(|existing| existing.item.state == ItemState::Active)
        {
            return Err(QueueError::Duplicate(id));
        }

        let now = Utc::now();
        let delay = chrono::Duration::try_milliseconds(options.delay_ms.min(i64::MAX as u64) as i64)
            .unwrap_or(chrono::Duration::MAX);
        let item = QueueItem {
            id: id.clone(),
            name: name.to_string(),
            queue: self.name.clone(),
            data,
            priority: options.priority,
            state: if options.delay_ms > 0 {
                ItemState::Delayed
            } else {
                ItemState::Waiting
            },
            attempts: options.attempts.unwrap_or(1).max(1),
            attempts_made: 0,
            backoff_delay_ms: options.backoff_delay_ms.unwrap_or(0),
            created_at: now,
            available_at: now.checked_add_signed(delay).unwrap_or(now),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
        };

        let seq = state.next_seq();
        state.items.insert(
            id,
            Entry {
                item: item.clone(),
                seq,
            },
        );
        Ok(item)
    }

    async fn dequeue(&self) -> Result<Option<QueueItem>, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        if state.paused {
            return Ok(None);
        }
        state.promote_due();

        let next = state
            .items
            .values()
            .filter(|e| e.item.state == ItemState::Waiting)
            .min_by_key(|e| (Reverse(e.item.priority), e.seq))
            .map(|e| e.item.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.items.get_mut(&id) else {
            return Ok(None);
        };
        entry.item.state = ItemState::Active;
        entry.item.attempts_made += 1;
        entry.item.processed_at = Some(Utc::now());
        Ok(Some(entry.item.clone()))
    }

    async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let item = state.active_mut(id)?;
        item.state = ItemState::Completed;
        item.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<ItemState, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let item = state.active_mut(id)?;
        let now = Utc::now();
        item.failed_reason = Some(reason.to_string());

        if item.attempts_made < item.attempts {
            item.state = ItemState::Delayed;
            item.available_at = now
                .checked_add_signed(backoff(item.backoff_delay_ms, item.attempts_made))
                .unwrap_or(now);
        } else {
            item.state = ItemState::Failed;
            item.finished_at = Some(now);
        }
        Ok(item.state)
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        let state = self.state.read().map_err(|_| QueueError::LockPoisoned)?;
        Ok(state.items.get(id).map(|entry| state.view(entry)))
    }

    async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        Ok(state.items.remove(id).is_some())
    }

    async fn list(&self, wanted: ItemState, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        state.promote_due();

        let mut entries: Vec<_> = state
            .items
            .values()
            .map(|entry| (state.view(entry), entry.seq))
            .filter(|(item, _)| item.state == wanted)
            .collect();
        entries.sort_by_key(|(item, seq)| (Reverse(item.priority), *seq));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|(item, _)| item)
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        state.promote_due();

        let mut counts = QueueCounts::default();
        for entry in state.items.values() {
            counts.increment(state.view(entry).state);
        }
        Ok(counts)
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        state.paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        state.paused = false;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        let state = self.state.read().map_err(|_| QueueError::LockPoisoned)?;
        Ok(state.paused)
    }

    async fn clean(&self, wanted: ItemState, older_than: Duration) -> Result<usize, QueueError> {
        if !wanted.is_terminal() {
            return Err(QueueError::InvalidArgument(format!(
                "can only clean completed or failed items, not {}",
                wanted
            )));
        }
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let before = state.items.len();
        state.items.retain(|_, entry| {
            let finished = entry.item.finished_at.unwrap_or(entry.item.created_at);
            !(entry.item.state == wanted && finished <= cutoff)
        });
        Ok(before - state.items.len())
    }

    async fn retry_failed(&self, limit: usize) -> Result<usize, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let mut failed: Vec<_> = state
            .items
            .values()
            .filter(|e| e.item.state == ItemState::Failed)
            .map(|e| (e.item.finished_at, e.seq, e.item.id.clone()))
            .collect();
        failed.sort();

        let now = Utc::now();
        let mut retried = 0;
        for (_, _, id) in failed.into_iter().take(limit) {
            let seq = state.next_seq();
            if let Some(entry) = state.items.get_mut(&id) {
                entry.seq = seq;
                entry.item.state = ItemState::Waiting;
                entry.item.attempts_made = 0;
                entry.item.available_at = now;
                entry.item.processed_at = None;
                entry.item.finished_at = None;
                entry.item.failed_reason = None;
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn add_repeatable(&self, job: RepeatableJob) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        state.repeatables.insert(job.key.clone(), job);
        Ok(())
    }

    async fn remove_repeatable(&self, key: &str) -> Result<bool, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        Ok(state.repeatables.remove(key).is_some())
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>, QueueError> {
        let state = self.state.read().map_err(|_| QueueError::LockPoisoned)?;
        Ok(state.repeatables.values().cloned().collect())
    }
}
