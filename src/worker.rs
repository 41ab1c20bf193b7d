//! Worker pools: one bounded-concurrency pull loop per named queue.
//!
//! Each pulled item is marked running through the status recorder, dispatched
//! to its registered handler, and settled back into the broker. A missing
//! handler registration is a programming error and fails the item loudly and
//! terminally — misconfigured producers surface immediately instead of
//! silently losing work.
//!
//! Handlers must be idempotent: delivery is at-least-once, and a handler that
//! hangs is eventually reclaimed and redelivered by the broker's stall
//! detection, not by a worker-side timeout.

use crate::{
    Result,
    broker::Broker,
    error::SwitchyardError,
    job::{JobType, QueueItem, QueueName},
    recorder::JobStatusRecorder,
};
use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// Business-logic contract: consumes the item, returns the result payload
/// persisted onto the durable record. Must be safe to invoke more than once
/// with the same payload.
pub type JobHandler = Arc<
    dyn Fn(QueueItem) -> Pin<Box<dyn std::future::Future<Output = Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Handler lookup keyed by [`JobType`].
///
/// Registration should be exhaustive; [`ensure_exhaustive`](Self::ensure_exhaustive)
/// turns a forgotten handler into a startup error instead of a runtime one.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, job_type: JobType, handler: JobHandler) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<&JobHandler> {
        self.handlers.get(&job_type)
    }

    /// Fail at startup if any job type lacks a handler.
    pub fn ensure_exhaustive(&self) -> Result<()> {
        for job_type in JobType::ALL {
            if !self.handlers.contains_key(&job_type) {
                return Err(SwitchyardError::Config(format!(
                    "no handler registered for job type '{}'",
                    job_type
                )));
            }
        }
        Ok(())
    }
}

pub struct Worker {
    broker: Arc<dyn Broker>,
    recorder: Arc<JobStatusRecorder>,
    handlers: Arc<HandlerRegistry>,
    queue: QueueName,
    concurrency: usize,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        recorder: Arc<JobStatusRecorder>,
        handlers: Arc<HandlerRegistry>,
        queue: QueueName,
    ) -> Self {
        Self {
            broker,
            recorder,
            handlers,
            queue,
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Pull until shut down, then drain in-flight handlers before returning.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(queue = %self.queue, concurrency = self.concurrency, "worker started");
        let slots = Arc::new(Semaphore::new(self.concurrency));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(queue = %self.queue, "worker shutting down");
                    break;
                }
                permit = slots.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| SwitchyardError::Worker {
                        message: "worker semaphore closed".to_string(),
                    })?;
                    match self.broker.pull(self.queue).await {
                        Ok(Some(item)) => {
                            let broker = self.broker.clone();
                            let recorder = self.recorder.clone();
                            let handlers = self.handlers.clone();
                            tokio::spawn(async move {
                                process_item(broker, recorder, handlers, item).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            sleep(self.poll_interval).await;
                        }
                        Err(e) => {
                            drop(permit);
                            error!(queue = %self.queue, error = %e, "error pulling item");
                            sleep(self.poll_interval).await;
                        }
                    }
                }
            }
        }

        // All permits back means every dispatched handler has settled.
        let _drain = slots
            .acquire_many(self.concurrency as u32)
            .await
            .map_err(|_| SwitchyardError::Worker {
                message: "worker semaphore closed during drain".to_string(),
            })?;
        info!(queue = %self.queue, "worker drained");
        Ok(())
    }
}

async fn process_item(
    broker: Arc<dyn Broker>,
    recorder: Arc<JobStatusRecorder>,
    handlers: Arc<HandlerRegistry>,
    item: QueueItem,
) {
    let durable_job_id = recorder.ensure_running(&item).await;
    // Thread the ensured id explicitly; the broker's copy was updated too so
    // a redelivery after this attempt carries it.
    let mut item = item;
    if item.durable_job_id.is_none() {
        item.durable_job_id = durable_job_id;
    }

    info!(
        job_type = %item.job_type,
        item_id = %item.id,
        durable_job_id = ?item.durable_job_id,
        tenant_id = item.tenant_id().unwrap_or("-"),
        attempt = item.attempts_made,
        max_attempts = item.max_attempts,
        "job started"
    );

    let Some(handler) = handlers.get(item.job_type) else {
        // Configuration error, not work to retry.
        error!(
            job_type = %item.job_type,
            item_id = %item.id,
            "unknown job type: no handler registered"
        );
        if let Err(e) = broker
            .fail_terminal(item.id, &format!("unknown job type: {}", item.job_type))
            .await
        {
            error!(item_id = %item.id, error = %e, "failed to settle unroutable item");
        }
        return;
    };

    match handler(item.clone()).await {
        Ok(result) => {
            debug!(item_id = %item.id, "handler succeeded");
            if let Err(e) = broker.complete(item.id, result).await {
                error!(item_id = %item.id, error = %e, "failed to settle completed item");
            }
        }
        Err(e) => {
            warn!(
                job_type = %item.job_type,
                item_id = %item.id,
                attempt = item.attempts_made,
                max_attempts = item.max_attempts,
                error = %e,
                "handler failed"
            );
            if let Err(e) = broker.fail(item.id, &e.to_string()).await {
                error!(item_id = %item.id, error = %e, "failed to settle failed item");
            }
        }
    }
}

/// Runs one worker per named queue and coordinates their shutdown.
pub struct WorkerPool {
    workers: Vec<Worker>,
    shutdown_tx: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            shutdown_tx: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn add_worker(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Spawn every worker. Returns immediately; workers run until
    /// [`shutdown`](Self::shutdown).
    pub fn start(&mut self) {
        info!(workers = self.workers.len(), "starting worker pool");
        for worker in self.workers.drain(..) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            self.shutdown_tx.push(shutdown_tx);
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown_rx).await {
                    error!(error = %e, "worker exited with error");
                }
            }));
        }
    }

    /// Stop pulling new items everywhere and wait for in-flight handlers to
    /// finish.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down worker pool");
        for tx in self.shutdown_tx.drain(..) {
            if tx.send(()).await.is_err() {
                warn!("worker already stopped before shutdown signal");
            }
        }
        for handle in self.handles.drain(..) {
            handle.await.map_err(|e| SwitchyardError::Worker {
                message: format!("worker task failed: {}", e),
            })?;
        }
        Ok(())
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
