//! In-flight job broker: named queues of pending/active/delayed/settled
//! items, with lifecycle events and an operator control surface.
//!
//! The broker owns every [`QueueItem`] for its lifetime. Workers only observe
//! items through [`Broker::pull`] and the [`QueueEvent`] broadcast channel;
//! the status recorder and dedup controller consume the same channel, so both
//! see settlements in the order the broker produced them for a given item.
//!
//! Redelivery is the broker's decision: a failed item with attempts remaining
//! is parked in the delayed set according to its [`BackoffPolicy`] and pulled
//! again later. Only once attempts are exhausted does the failure settle.

use crate::{
    Result,
    error::SwitchyardError,
    job::{ItemId, JobId, QueueItem, QueueName},
    stats::{FleetTotals, ItemState, QueueCounts},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Redelivery schedule applied between failed attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    None,
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before redelivering after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms } => {
                let shift = attempt.saturating_sub(1).min(16);
                Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential { base_ms: 2_000 }
    }
}

/// Lifecycle event emitted when an item settles an attempt.
///
/// `Failed` fires on every failed attempt, terminal or not; consumers decide
/// what to do from `item.attempts_made` vs `item.max_attempts`.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Completed {
        item: QueueItem,
        result: serde_json::Value,
    },
    Failed {
        item: QueueItem,
        error: String,
    },
}

impl QueueEvent {
    pub fn item(&self) -> &QueueItem {
        match self {
            QueueEvent::Completed { item, .. } => item,
            QueueEvent::Failed { item, .. } => item,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Write one entry onto its queue. `delay` defers the first delivery.
    async fn enqueue(
        &self,
        item: QueueItem,
        backoff: BackoffPolicy,
        delay: Option<Duration>,
    ) -> Result<ItemId>;

    /// Take the next deliverable item off the queue, marking it active and
    /// counting the delivery attempt. Returns `None` when the queue is empty,
    /// everything is delayed, or the queue is paused.
    async fn pull(&self, queue: QueueName) -> Result<Option<QueueItem>>;

    /// Settle the current attempt successfully.
    async fn complete(&self, item_id: ItemId, result: serde_json::Value) -> Result<()>;

    /// Settle the current attempt as failed. Redelivers with backoff while
    /// attempts remain; otherwise the item lands in the failed set.
    async fn fail(&self, item_id: ItemId, error: &str) -> Result<()>;

    /// Settle as failed immediately, consuming any remaining attempts. Used
    /// for non-retryable conditions where redelivery would only repeat the
    /// same error.
    async fn fail_terminal(&self, item_id: ItemId, error: &str) -> Result<()>;

    /// Record the durable job id on the broker's copy of an active item so a
    /// redelivery after this attempt carries it.
    async fn set_durable_job_id(&self, item_id: ItemId, job_id: JobId) -> Result<()>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts>;

    async fn fleet_totals(&self) -> Result<FleetTotals>;

    /// Bounded recent-items listing for one state of one queue, newest first.
    async fn recent(&self, queue: QueueName, state: ItemState, limit: usize)
    -> Result<Vec<QueueItem>>;

    async fn pause(&self, queue: QueueName) -> Result<()>;

    async fn resume(&self, queue: QueueName) -> Result<()>;

    /// Move a failed item back to waiting with a fresh attempt budget.
    async fn retry_item(&self, item_id: ItemId) -> Result<()>;

    /// Drop a waiting, delayed, or failed item.
    async fn remove_item(&self, item_id: ItemId) -> Result<()>;

    /// Sweep settled items older than `grace` out of the completed or failed
    /// set. Returns the number removed.
    async fn clean(&self, queue: QueueName, grace: Duration, state: ItemState) -> Result<u64>;

    /// Subscribe to settlement events. Each subscriber sees every event from
    /// the point of subscription.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
}

struct StoredItem {
    item: QueueItem,
    backoff: BackoffPolicy,
}

struct DelayedItem {
    ready_at: DateTime<Utc>,
    stored: StoredItem,
}

struct SettledItem {
    item: QueueItem,
    settled_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<StoredItem>,
    delayed: Vec<DelayedItem>,
    active: HashMap<ItemId, StoredItem>,
    completed: VecDeque<SettledItem>,
    failed: VecDeque<SettledItem>,
    paused: bool,
}

/// In-process broker holding every queue's state in memory.
pub struct MemoryBroker {
    queues: Mutex<HashMap<QueueName, QueueState>>,
    events: broadcast::Sender<QueueEvent>,
    settled_retention: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_retention(1_000)
    }

    /// Cap on how many settled items each of a queue's completed and failed
    /// sets keeps before the oldest are evicted.
    pub fn with_retention(settled_retention: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            queues: Mutex::new(HashMap::new()),
            events,
            settled_retention,
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine; settlement state is already recorded.
        let _ = self.events.send(event);
    }

    fn push_settled(retention: usize, set: &mut VecDeque<SettledItem>, settled: SettledItem) {
        set.push_back(settled);
        while set.len() > retention {
            set.pop_front();
        }
    }

    fn promote_due(state: &mut QueueState, now: DateTime<Utc>) {
        let mut idx = 0;
        while idx < state.delayed.len() {
            if state.delayed[idx].ready_at <= now {
                let due = state.delayed.swap_remove(idx);
                state.waiting.push_back(due.stored);
            } else {
                idx += 1;
            }
        }
    }

    fn take_active(
        queues: &mut HashMap<QueueName, QueueState>,
        item_id: ItemId,
    ) -> Result<(QueueName, StoredItem)> {
        for (queue, state) in queues.iter_mut() {
            if let Some(stored) = state.active.remove(&item_id) {
                return Ok((*queue, stored));
            }
        }
        Err(SwitchyardError::ItemNotFound {
            id: item_id.to_string(),
        })
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        item: QueueItem,
        backoff: BackoffPolicy,
        delay: Option<Duration>,
    ) -> Result<ItemId> {
        let item_id = item.id;
        let queue = item.job_type.queue();
        let stored = StoredItem { item, backoff };

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue).or_default();
        match delay {
            Some(delay) if !delay.is_zero() => {
                let ready_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                state.delayed.push(DelayedItem { ready_at, stored });
            }
            _ => state.waiting.push_back(stored),
        }
        debug!(queue = %queue, item_id = %item_id, "item enqueued");
        Ok(item_id)
    }

    async fn pull(&self, queue: QueueName) -> Result<Option<QueueItem>> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue).or_default();
        if state.paused {
            return Ok(None);
        }
        Self::promote_due(state, Utc::now());

        let Some(mut stored) = state.waiting.pop_front() else {
            return Ok(None);
        };
        stored.item.attempts_made += 1;
        let item = stored.item.clone();
        state.active.insert(item.id, stored);
        Ok(Some(item))
    }

    async fn complete(&self, item_id: ItemId, result: serde_json::Value) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let (queue, stored) = Self::take_active(&mut queues, item_id)?;
        let state = queues.entry(queue).or_default();
        let item = stored.item;
        Self::push_settled(
            self.settled_retention,
            &mut state.completed,
            SettledItem {
                item: item.clone(),
                settled_at: Utc::now(),
            },
        );
        drop(queues);
        self.emit(QueueEvent::Completed { item, result });
        Ok(())
    }

    async fn fail(&self, item_id: ItemId, error: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let (queue, stored) = Self::take_active(&mut queues, item_id)?;
        let state = queues.entry(queue).or_default();
        let item = stored.item.clone();

        if item.attempts_exhausted() {
            Self::push_settled(
                self.settled_retention,
                &mut state.failed,
                SettledItem {
                    item: item.clone(),
                    settled_at: Utc::now(),
                },
            );
        } else {
            let delay = stored.backoff.delay_for(item.attempts_made);
            let ready_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            state.delayed.push(DelayedItem { ready_at, stored });
        }
        drop(queues);
        self.emit(QueueEvent::Failed {
            item,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn fail_terminal(&self, item_id: ItemId, error: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let (queue, mut stored) = Self::take_active(&mut queues, item_id)?;
        stored.item.attempts_made = stored.item.max_attempts;
        let state = queues.entry(queue).or_default();
        let item = stored.item;
        Self::push_settled(
            self.settled_retention,
            &mut state.failed,
            SettledItem {
                item: item.clone(),
                settled_at: Utc::now(),
            },
        );
        drop(queues);
        self.emit(QueueEvent::Failed {
            item,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn set_durable_job_id(&self, item_id: ItemId, job_id: JobId) -> Result<()> {
        let mut queues = self.queues.lock().await;
        for state in queues.values_mut() {
            if let Some(stored) = state.active.get_mut(&item_id) {
                stored.item.durable_job_id = Some(job_id);
                return Ok(());
            }
        }
        Err(SwitchyardError::ItemNotFound {
            id: item_id.to_string(),
        })
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue).or_default();
        Ok(QueueCounts {
            queue,
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            paused: state.paused,
        })
    }

    async fn fleet_totals(&self) -> Result<FleetTotals> {
        let mut totals = FleetTotals::default();
        for queue in QueueName::ALL {
            totals.add(&self.counts(queue).await?);
        }
        Ok(totals)
    }

    async fn recent(
        &self,
        queue: QueueName,
        state: ItemState,
        limit: usize,
    ) -> Result<Vec<QueueItem>> {
        let mut queues = self.queues.lock().await;
        let queue_state = queues.entry(queue).or_default();
        let items: Vec<QueueItem> = match state {
            ItemState::Waiting => queue_state
                .waiting
                .iter()
                .rev()
                .take(limit)
                .map(|s| s.item.clone())
                .collect(),
            ItemState::Active => queue_state
                .active
                .values()
                .take(limit)
                .map(|s| s.item.clone())
                .collect(),
            ItemState::Delayed => queue_state
                .delayed
                .iter()
                .take(limit)
                .map(|d| d.stored.item.clone())
                .collect(),
            ItemState::Completed => queue_state
                .completed
                .iter()
                .rev()
                .take(limit)
                .map(|s| s.item.clone())
                .collect(),
            ItemState::Failed => queue_state
                .failed
                .iter()
                .rev()
                .take(limit)
                .map(|s| s.item.clone())
                .collect(),
        };
        Ok(items)
    }

    async fn pause(&self, queue: QueueName) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue).or_default().paused = false;
        Ok(())
    }

    async fn retry_item(&self, item_id: ItemId) -> Result<()> {
        let mut queues = self.queues.lock().await;
        for state in queues.values_mut() {
            if let Some(pos) = state.failed.iter().position(|s| s.item.id == item_id) {
                if let Some(settled) = state.failed.remove(pos) {
                    let mut item = settled.item;
                    item.attempts_made = 0;
                    state.waiting.push_back(StoredItem {
                        item,
                        backoff: BackoffPolicy::default(),
                    });
                }
                return Ok(());
            }
        }
        Err(SwitchyardError::ItemNotFound {
            id: item_id.to_string(),
        })
    }

    async fn remove_item(&self, item_id: ItemId) -> Result<()> {
        let mut queues = self.queues.lock().await;
        for state in queues.values_mut() {
            if let Some(pos) = state.waiting.iter().position(|s| s.item.id == item_id) {
                state.waiting.remove(pos);
                return Ok(());
            }
            if let Some(pos) = state.delayed.iter().position(|d| d.stored.item.id == item_id) {
                state.delayed.swap_remove(pos);
                return Ok(());
            }
            if let Some(pos) = state.failed.iter().position(|s| s.item.id == item_id) {
                state.failed.remove(pos);
                return Ok(());
            }
        }
        Err(SwitchyardError::ItemNotFound {
            id: item_id.to_string(),
        })
    }

    async fn clean(&self, queue: QueueName, grace: Duration, state: ItemState) -> Result<u64> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let mut queues = self.queues.lock().await;
        let queue_state = queues.entry(queue).or_default();
        let set = match state {
            ItemState::Completed => &mut queue_state.completed,
            ItemState::Failed => &mut queue_state.failed,
            other => {
                return Err(SwitchyardError::Queue {
                    message: format!("clean only applies to settled items, got {:?}", other),
                });
            }
        };
        let before = set.len();
        set.retain(|settled| settled.settled_at > cutoff);
        Ok((before - set.len()) as u64)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use serde_json::json;

    fn item(job_type: JobType, max_attempts: u32) -> QueueItem {
        let mut item = QueueItem::new(job_type, json!({"tenantId": "t1"}));
        item.max_attempts = max_attempts;
        item
    }

    #[tokio::test]
    async fn test_pull_counts_attempts() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(item(JobType::SiteScan, 3), BackoffPolicy::None, None)
            .await
            .unwrap();

        let pulled = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        assert_eq!(pulled.attempts_made, 1);
        assert!(broker.pull(QueueName::Seo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_redelivers_until_exhausted() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(item(JobType::SiteScan, 2), BackoffPolicy::None, None)
            .await
            .unwrap();

        let first = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        broker.fail(first.id, "boom").await.unwrap();

        // Attempt 1 of 2 failed: redelivered, not settled.
        let counts = broker.counts(QueueName::Seo).await.unwrap();
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.waiting + counts.delayed, 1);

        let second = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        assert_eq!(second.attempts_made, 2);
        broker.fail(second.id, "boom again").await.unwrap();

        let counts = broker.counts(QueueName::Seo).await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_fail_terminal_skips_remaining_attempts() {
        let broker = MemoryBroker::new();
        let mut events = broker.subscribe();
        broker
            .enqueue(item(JobType::SiteScan, 5), BackoffPolicy::None, None)
            .await
            .unwrap();

        let pulled = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        broker.fail_terminal(pulled.id, "unknown job type").await.unwrap();

        let counts = broker.counts(QueueName::Seo).await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting + counts.delayed, 0);

        match events.recv().await.unwrap() {
            QueueEvent::Failed { item, .. } => assert!(item.attempts_exhausted()),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backoff_delays_redelivery() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(
                item(JobType::SiteScan, 2),
                BackoffPolicy::Fixed { delay_ms: 60_000 },
                None,
            )
            .await
            .unwrap();

        let first = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        broker.fail(first.id, "transient").await.unwrap();

        // The retry sits in the delayed set until its backoff elapses.
        assert!(broker.pull(QueueName::Seo).await.unwrap().is_none());
        let counts = broker.counts(QueueName::Seo).await.unwrap();
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_delayed_enqueue_not_immediately_deliverable() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(
                item(JobType::SocialPost, 1),
                BackoffPolicy::None,
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert!(broker.pull(QueueName::Social).await.unwrap().is_none());
        assert_eq!(broker.counts(QueueName::Social).await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_pause_blocks_pull() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(item(JobType::AnalyticsSync, 1), BackoffPolicy::None, None)
            .await
            .unwrap();

        broker.pause(QueueName::Analytics).await.unwrap();
        assert!(broker.pull(QueueName::Analytics).await.unwrap().is_none());
        assert!(broker.counts(QueueName::Analytics).await.unwrap().paused);

        broker.resume(QueueName::Analytics).await.unwrap();
        assert!(broker.pull(QueueName::Analytics).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_completed_event_emitted() {
        let broker = MemoryBroker::new();
        let mut events = broker.subscribe();
        broker
            .enqueue(item(JobType::SiteScan, 1), BackoffPolicy::None, None)
            .await
            .unwrap();

        let pulled = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        broker.complete(pulled.id, json!({"pages": 10})).await.unwrap();

        match events.recv().await.unwrap() {
            QueueEvent::Completed { item, result } => {
                assert_eq!(item.id, pulled.id);
                assert_eq!(result, json!({"pages": 10}));
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_item_resets_attempts() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(item(JobType::SiteScan, 1), BackoffPolicy::None, None)
            .await
            .unwrap();
        let pulled = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        broker.fail(pulled.id, "terminal").await.unwrap();

        broker.retry_item(pulled.id).await.unwrap();
        let retried = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        assert_eq!(retried.attempts_made, 1);
        assert_eq!(retried.id, pulled.id);
    }

    #[tokio::test]
    async fn test_clean_sweeps_settled_items() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(item(JobType::SiteScan, 1), BackoffPolicy::None, None)
            .await
            .unwrap();
        let pulled = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        broker.complete(pulled.id, json!(null)).await.unwrap();

        // Grace period still covers the item: nothing removed.
        let removed = broker
            .clean(QueueName::Seo, Duration::from_secs(3600), ItemState::Completed)
            .await
            .unwrap();
        assert_eq!(removed, 0);

        // Zero grace sweeps everything settled.
        let removed = broker
            .clean(QueueName::Seo, Duration::ZERO, ItemState::Completed)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(broker.counts(QueueName::Seo).await.unwrap().completed, 0);

        assert!(
            broker
                .clean(QueueName::Seo, Duration::ZERO, ItemState::Waiting)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_set_durable_job_id_survives_redelivery() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(item(JobType::SiteScan, 2), BackoffPolicy::None, None)
            .await
            .unwrap();

        let first = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        let durable_id = uuid::Uuid::new_v4();
        broker.set_durable_job_id(first.id, durable_id).await.unwrap();
        broker.fail(first.id, "transient").await.unwrap();

        let second = broker.pull(QueueName::Seo).await.unwrap().unwrap();
        assert_eq!(second.durable_job_id, Some(durable_id));
    }

    #[test]
    fn test_exponential_backoff_schedule() {
        let backoff = BackoffPolicy::Exponential { base_ms: 100 };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
    }
}
