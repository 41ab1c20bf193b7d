//! Queue registry: the single enqueue entry point for producers.
//!
//! Producers hand over a [`JobType`] and a payload; the registry resolves the
//! owning queue from the static topology and writes one broker entry. The
//! topology (queue to concurrency) is defined once at process start and
//! validated then — an unmapped job type cannot exist because the mapping is
//! an exhaustive match on the enum, and a queue missing its concurrency entry
//! is a startup configuration error, not a call-time surprise.

use crate::{
    Result,
    broker::{BackoffPolicy, Broker},
    dedup::DedupController,
    error::SwitchyardError,
    job::{ItemId, JobId, JobType, QueueItem, QueueName},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-enqueue options, forwarded to the broker's scheduling knobs.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Delivery attempt budget, including the first attempt.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// Defer the first delivery.
    pub delay: Option<Duration>,
    /// Durable record pre-created by the producer, if any.
    pub durable_job_id: Option<JobId>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::default(),
            delay: None,
            durable_job_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_durable_job_id(mut self, id: JobId) -> Self {
        self.durable_job_id = Some(id);
        self
    }
}

pub struct QueueRegistry {
    broker: Arc<dyn Broker>,
    dedup: Arc<DedupController>,
    concurrency: HashMap<QueueName, usize>,
}

impl QueueRegistry {
    /// Build the registry from a static topology. Every named queue must
    /// carry a concurrency entry of at least 1; anything else is a
    /// configuration error caught here, at startup.
    pub fn new(
        broker: Arc<dyn Broker>,
        dedup: Arc<DedupController>,
        concurrency: HashMap<QueueName, usize>,
    ) -> Result<Self> {
        for queue in QueueName::ALL {
            match concurrency.get(&queue) {
                None => {
                    return Err(SwitchyardError::Config(format!(
                        "queue '{}' has no concurrency entry",
                        queue
                    )));
                }
                Some(0) => {
                    return Err(SwitchyardError::Config(format!(
                        "queue '{}' has concurrency 0",
                        queue
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            broker,
            dedup,
            concurrency,
        })
    }

    pub fn concurrency(&self, queue: QueueName) -> usize {
        self.concurrency.get(&queue).copied().unwrap_or(1)
    }

    /// Write one entry onto the queue owning `job_type`.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<ItemId> {
        let mut item = QueueItem::new(job_type, payload);
        item.max_attempts = options.attempts.max(1);
        item.durable_job_id = options.durable_job_id;
        let queue = job_type.queue();
        let item_id = self
            .broker
            .enqueue(item, options.backoff, options.delay)
            .await?;
        debug!(
            job_type = %job_type,
            queue = %queue,
            item_id = %item_id,
            "job enqueued"
        );
        Ok(item_id)
    }

    /// Enqueue with per-tenant dedup: reserves the `(tenant, job-type)` slot
    /// first and returns `None` (nothing enqueued) when the slot is already
    /// held. The tenant is read from the payload's `tenantId` field.
    pub async fn enqueue_deduped(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Option<ItemId>> {
        let tenant_id = payload
            .get("tenantId")
            .and_then(|v| v.as_str())
            .map(|t| t.to_string());
        if !self.dedup.try_reserve(tenant_id.as_deref(), job_type).await {
            return Ok(None);
        }
        let item_id = self.enqueue(job_type, payload, options).await?;
        Ok(Some(item_id))
    }
}

/// Default topology for the platform's six queues.
///
/// Content generation is the heavy I/O-bound workload; the rest run narrow.
pub fn default_topology() -> HashMap<QueueName, usize> {
    HashMap::from([
        (QueueName::Content, 4),
        (QueueName::Seo, 2),
        (QueueName::Analytics, 2),
        (QueueName::AbTest, 1),
        (QueueName::Social, 2),
        (QueueName::Microsite, 1),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MemoryBroker,
        coordination::MemoryCoordinationStore,
        stats::ItemState,
    };
    use serde_json::json;

    fn registry() -> QueueRegistry {
        let broker = Arc::new(MemoryBroker::new());
        let dedup = Arc::new(DedupController::with_safety_ttl(
            Arc::new(MemoryCoordinationStore::new()),
            None,
        ));
        QueueRegistry::new(broker, dedup, default_topology()).unwrap()
    }

    #[test]
    fn test_topology_validated_at_startup() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let dedup = Arc::new(DedupController::with_safety_ttl(
            Arc::new(MemoryCoordinationStore::new()),
            None,
        ));

        let mut missing = default_topology();
        missing.remove(&QueueName::Microsite);
        assert!(matches!(
            QueueRegistry::new(broker.clone(), dedup.clone(), missing),
            Err(SwitchyardError::Config(_))
        ));

        let mut zero = default_topology();
        zero.insert(QueueName::Seo, 0);
        assert!(matches!(
            QueueRegistry::new(broker, dedup, zero),
            Err(SwitchyardError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_routes_to_owning_queue() {
        let registry = registry();
        registry
            .enqueue(
                JobType::SiteScan,
                json!({"tenantId": "t1"}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let seo = registry.broker.counts(QueueName::Seo).await.unwrap();
        assert_eq!(seo.waiting, 1);
        let content = registry.broker.counts(QueueName::Content).await.unwrap();
        assert_eq!(content.waiting, 0);
    }

    #[tokio::test]
    async fn test_enqueue_applies_options() {
        let registry = registry();
        registry
            .enqueue(
                JobType::SocialPost,
                json!({"tenantId": "t1"}),
                EnqueueOptions::default()
                    .with_attempts(5)
                    .with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let delayed = registry
            .broker
            .recent(QueueName::Social, ItemState::Delayed, 10)
            .await
            .unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].max_attempts, 5);
    }

    #[tokio::test]
    async fn test_enqueue_deduped_suppresses_duplicates() {
        let registry = registry();
        let payload = json!({"tenantId": "t1"});

        let first = registry
            .enqueue_deduped(JobType::SiteScan, payload.clone(), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(first.is_some());

        let second = registry
            .enqueue_deduped(JobType::SiteScan, payload, EnqueueOptions::default())
            .await
            .unwrap();
        assert!(second.is_none());

        assert_eq!(registry.broker.counts(QueueName::Seo).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_enqueue_deduped_fanout_never_suppressed() {
        let registry = registry();
        let payload = json!({"tenantId": "all"});
        for _ in 0..3 {
            assert!(
                registry
                    .enqueue_deduped(
                        JobType::RoadmapScan,
                        payload.clone(),
                        EnqueueOptions::default()
                    )
                    .await
                    .unwrap()
                    .is_some()
            );
        }
        assert_eq!(registry.broker.counts(QueueName::Seo).await.unwrap().waiting, 3);
    }
}
