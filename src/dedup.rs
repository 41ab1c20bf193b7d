//! Per-tenant dedup control: at most one outstanding job per
//! `(tenant, job-type)` pair.
//!
//! The dedup key is written before enqueue and cleared deterministically on
//! terminal outcomes. The write itself is atomic (`set_if_absent`), but the
//! key-write/enqueue pair is not transactional across the producer/broker
//! boundary; the occasional duplicate re-does idempotent work and is
//! accepted. A safety-net TTL covers the crash window between dispatch and
//! settlement so a wedged key cannot block a tenant forever.
//!
//! The release rule on failure is exact: a retryable failure
//! (`attempts_made < max_attempts`) must leave the key in place so a racing
//! duplicate enqueue stays suppressed while the retry is pending.

use crate::{
    broker::QueueEvent,
    coordination::CoordinationStore,
    job::{JobType, QueueItem, TENANT_ALL},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub struct DedupController {
    store: Arc<dyn CoordinationStore>,
    safety_ttl: Option<Duration>,
}

fn dedup_key(tenant_id: &str, job_type: JobType) -> String {
    format!("dedup:{}:{}", tenant_id, job_type)
}

/// Fan-out jobs (absent tenant or the `all` sentinel) are exempt from dedup.
fn dedup_tenant(tenant_id: Option<&str>) -> Option<&str> {
    tenant_id.filter(|t| *t != TENANT_ALL)
}

impl DedupController {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        // Six hours outlasts any sane job plus its retries.
        Self::with_safety_ttl(store, Some(Duration::from_secs(6 * 3600)))
    }

    pub fn with_safety_ttl(store: Arc<dyn CoordinationStore>, safety_ttl: Option<Duration>) -> Self {
        Self { store, safety_ttl }
    }

    /// Claim the dedup slot for `(tenant, job_type)`. Returns `true` when the
    /// caller may enqueue. Fan-out jobs always pass. A coordination store
    /// failure fails closed: no reservation, no enqueue.
    pub async fn try_reserve(&self, tenant_id: Option<&str>, job_type: JobType) -> bool {
        let Some(tenant) = dedup_tenant(tenant_id) else {
            return true;
        };
        let key = dedup_key(tenant, job_type);
        match self.store.set_if_absent(&key, "1", self.safety_ttl).await {
            Ok(reserved) => {
                if !reserved {
                    debug!(tenant_id = tenant, job_type = %job_type, "duplicate enqueue suppressed");
                }
                reserved
            }
            Err(e) => {
                warn!(
                    tenant_id = tenant,
                    job_type = %job_type,
                    error = %e,
                    "dedup reservation unavailable, failing closed"
                );
                false
            }
        }
    }

    /// Whether the slot is currently held. Store failures read as held
    /// (fail closed), matching [`try_reserve`](Self::try_reserve).
    pub async fn is_reserved(&self, tenant_id: Option<&str>, job_type: JobType) -> bool {
        let Some(tenant) = dedup_tenant(tenant_id) else {
            return false;
        };
        match self.store.exists(&dedup_key(tenant, job_type)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(tenant_id = tenant, error = %e, "dedup check unavailable, failing closed");
                true
            }
        }
    }

    async fn release(&self, item: &QueueItem) {
        let Some(tenant) = dedup_tenant(item.tenant_id()) else {
            return;
        };
        let key = dedup_key(tenant, item.job_type);
        if let Err(e) = self.store.remove(&key).await {
            warn!(
                tenant_id = tenant,
                job_type = %item.job_type,
                error = %e,
                "failed to release dedup key; TTL will reclaim it"
            );
        }
    }

    /// Apply one settlement event: always release on completion, release on
    /// failure only once attempts are exhausted.
    pub async fn handle_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Completed { item, .. } => self.release(item).await,
            QueueEvent::Failed { item, .. } => {
                if item.attempts_exhausted() {
                    self.release(item).await;
                }
            }
        }
    }

    /// Consume settlement events until the broker's channel closes.
    pub async fn run(&self, mut events: broadcast::Receiver<QueueEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "dedup controller lagged behind broker events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;
    use serde_json::json;

    fn controller() -> (Arc<MemoryCoordinationStore>, DedupController) {
        let store = Arc::new(MemoryCoordinationStore::new());
        let controller = DedupController::with_safety_ttl(store.clone(), None);
        (store, controller)
    }

    fn failed_item(tenant: &str, attempts_made: u32, max_attempts: u32) -> QueueEvent {
        let mut item = QueueItem::new(JobType::SiteScan, json!({"tenantId": tenant}));
        item.attempts_made = attempts_made;
        item.max_attempts = max_attempts;
        QueueEvent::Failed {
            item,
            error: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reserve_blocks_duplicates() {
        let (_, controller) = controller();
        assert!(controller.try_reserve(Some("t1"), JobType::SiteScan).await);
        assert!(!controller.try_reserve(Some("t1"), JobType::SiteScan).await);
        // A different pair is unaffected.
        assert!(controller.try_reserve(Some("t2"), JobType::SiteScan).await);
        assert!(controller.try_reserve(Some("t1"), JobType::SocialPost).await);
    }

    #[tokio::test]
    async fn test_fanout_jobs_exempt() {
        let (store, controller) = controller();
        assert!(controller.try_reserve(None, JobType::RoadmapScan).await);
        assert!(controller.try_reserve(Some(TENANT_ALL), JobType::RoadmapScan).await);
        assert!(controller.try_reserve(Some(TENANT_ALL), JobType::RoadmapScan).await);
        // Nothing written for exempt jobs.
        assert_eq!(store.memory_used_bytes().await.unwrap(), Some(0));
        assert!(!controller.is_reserved(Some(TENANT_ALL), JobType::RoadmapScan).await);
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_key() {
        let (_, controller) = controller();
        assert!(controller.try_reserve(Some("t1"), JobType::SiteScan).await);

        controller.handle_event(&failed_item("t1", 1, 3)).await;
        assert!(controller.is_reserved(Some("t1"), JobType::SiteScan).await);

        controller.handle_event(&failed_item("t1", 2, 3)).await;
        assert!(controller.is_reserved(Some("t1"), JobType::SiteScan).await);
    }

    #[tokio::test]
    async fn test_exhausted_failure_releases_key() {
        let (_, controller) = controller();
        assert!(controller.try_reserve(Some("t1"), JobType::SiteScan).await);

        controller.handle_event(&failed_item("t1", 3, 3)).await;
        assert!(!controller.is_reserved(Some("t1"), JobType::SiteScan).await);
        assert!(controller.try_reserve(Some("t1"), JobType::SiteScan).await);
    }

    #[tokio::test]
    async fn test_completion_releases_key() {
        let (_, controller) = controller();
        assert!(controller.try_reserve(Some("t1"), JobType::AnalyticsSync).await);

        let mut item = QueueItem::new(JobType::AnalyticsSync, json!({"tenantId": "t1"}));
        item.attempts_made = 1;
        item.max_attempts = 3;
        controller
            .handle_event(&QueueEvent::Completed {
                item,
                result: json!(null),
            })
            .await;

        assert!(!controller.is_reserved(Some("t1"), JobType::AnalyticsSync).await);
    }
}
