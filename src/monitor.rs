//! Coordination store memory monitor.
//!
//! Samples the store's reported memory usage on a fixed interval and logs it
//! for external alerting thresholds. Purely operational visibility: catches
//! unbounded broker growth before it becomes an outage, affects nothing else.

use crate::coordination::CoordinationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct MemoryMonitor {
    store: Arc<dyn CoordinationStore>,
    interval: Duration,
    warn_bytes: Option<u64>,
}

impl MemoryMonitor {
    pub fn new(store: Arc<dyn CoordinationStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            warn_bytes: None,
        }
    }

    /// Log at warn level once usage crosses this threshold.
    pub fn with_warn_threshold(mut self, warn_bytes: u64) -> Self {
        self.warn_bytes = Some(warn_bytes);
        self
    }

    /// Take one sample and log it. Exposed separately so tests do not need
    /// to drive the interval loop.
    pub async fn sample(&self) -> Option<u64> {
        match self.store.memory_used_bytes().await {
            Ok(Some(bytes)) => {
                match self.warn_bytes {
                    Some(threshold) if bytes >= threshold => {
                        warn!(used_bytes = bytes, threshold, "coordination store memory high");
                    }
                    _ => info!(used_bytes = bytes, "coordination store memory"),
                }
                Some(bytes)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to sample coordination store memory");
                None
            }
        }
    }

    /// Sample on the interval until shut down.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    self.sample().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;

    #[tokio::test]
    async fn test_sample_reports_usage() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store.put("dedup:t1:site_scan", "1", None).await.unwrap();

        let monitor = MemoryMonitor::new(store.clone(), Duration::from_secs(60));
        let sampled = monitor.sample().await.unwrap();
        assert_eq!(sampled, ("dedup:t1:site_scan".len() + 1) as u64);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let monitor = MemoryMonitor::new(store, Duration::from_millis(10));
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { monitor.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
