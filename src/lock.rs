//! Distributed, time-boxed mutual exclusion over the coordination store.
//!
//! Serializes singleton periodic operations (a cross-tenant roadmap scan, a
//! nightly sweep) across independently-deployed worker processes that share
//! only the coordination store. Acquisition is one atomic set-if-absent with
//! the TTL as expiry; release is a token-checked delete so a slow caller
//! whose TTL already lapsed can never delete a newer holder's lock.
//!
//! There is no renewal or heartbeating. Choose the TTL with generous
//! headroom over the protected operation's worst case (several times its p99
//! duration); an operation that outruns its TTL can lose the lock
//! mid-operation and run concurrently with a second instance.

use crate::{Result, coordination::CoordinationStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct LockService {
    store: Arc<dyn CoordinationStore>,
}

/// Proof of a held lock. Release it explicitly with
/// [`release`](LockGuard::release) or let the TTL expire it.
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    name: String,
    token: String,
}

fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

impl LockService {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Try to take the named lock. `Ok(None)` means another instance holds
    /// it: skip the work, do not spin. A store error fails closed — the
    /// caller holds nothing.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_if_absent(&lock_key(name), &token, Some(ttl))
            .await?;
        if !acquired {
            debug!(lock = name, "lock already held, skipping");
            return Ok(None);
        }
        info!(lock = name, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        Ok(Some(LockGuard {
            store: self.store.clone(),
            name: name.to_string(),
            token,
        }))
    }

    /// [`acquire`](Self::acquire) with store errors mapped to "not acquired",
    /// for call sites where a singleton run is simply skipped on any doubt.
    pub async fn acquire_or_skip(&self, name: &str, ttl: Duration) -> Option<LockGuard> {
        match self.acquire(name, ttl).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(lock = name, error = %e, "lock acquisition unavailable, failing closed");
                None
            }
        }
    }
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The acquisition token; only the holder whose token still matches may
    /// delete the key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock. A no-op if the TTL already expired and someone else
    /// re-acquired the name. Store failures are logged and swallowed; the
    /// lock then expires naturally.
    pub async fn release(self) {
        match self
            .store
            .delete_if_equals(&lock_key(&self.name), &self.token)
            .await
        {
            Ok(true) => debug!(lock = %self.name, "lock released"),
            Ok(false) => debug!(lock = %self.name, "lock already expired or re-acquired"),
            Err(e) => warn!(
                lock = %self.name,
                error = %e,
                "failed to release lock; it will expire at its TTL"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;

    fn service() -> (Arc<MemoryCoordinationStore>, LockService) {
        let store = Arc::new(MemoryCoordinationStore::new());
        let service = LockService::new(store.clone());
        (store, service)
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let (_, locks) = service();
        let ttl = Duration::from_secs(1);

        let guard = locks.acquire("x", ttl).await.unwrap();
        assert!(guard.is_some());
        assert!(locks.acquire("x", ttl).await.unwrap().is_none());

        guard.unwrap().release().await;
        assert!(locks.acquire("x", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_release_does_not_delete_new_holder() {
        let (store, locks) = service();

        let stale = locks
            .acquire("roadmap-scan", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        // Simulate TTL expiry plus re-acquisition by another instance.
        store
            .put("lock:roadmap-scan", "someone-elses-token", None)
            .await
            .unwrap();

        stale.release().await;
        assert_eq!(
            store.get("lock:roadmap-scan").await,
            Some("someone-elses-token".to_string())
        );
    }

    #[tokio::test]
    async fn test_acquire_after_ttl_expiry() {
        let (_, locks) = service();
        let first = locks
            .acquire("short", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks.acquire("short", Duration::from_secs(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (_, locks) = service();
        let locks = Arc::new(locks);
        let ttl = Duration::from_secs(300);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("roadmap-scan", ttl).await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_distinct_names_independent() {
        let (_, locks) = service();
        let ttl = Duration::from_secs(1);
        assert!(locks.acquire("a", ttl).await.unwrap().is_some());
        assert!(locks.acquire("b", ttl).await.unwrap().is_some());
    }
}
