//! Job status recorder: keeps the durable job store's view of a job's
//! lifecycle consistent with the broker's view.
//!
//! Two kinds of job meet here. Produced jobs arrive with a durable record
//! already created and its id on the item; repeatable jobs have no record
//! until their first `Running` transition, at which point the recorder
//! creates one and returns the id explicitly (and writes it onto the broker's
//! copy of the item so a redelivery finds it).
//!
//! Status tracking is best-effort observability, not a correctness dependency
//! for the work itself: every persistence failure is logged and swallowed so
//! a job store outage never blocks a handler from running or retrying.

use crate::{
    broker::{Broker, QueueEvent},
    job::{Job, JobId, QueueItem},
    store::JobStore,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct JobStatusRecorder {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
}

impl JobStatusRecorder {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Mark the item's job as running, creating the durable record first if
    /// the item does not carry one yet. Returns the durable id for the caller
    /// to thread through subsequent transitions, or `None` if the store was
    /// unreachable.
    pub async fn ensure_running(&self, item: &QueueItem) -> Option<JobId> {
        if let Some(id) = item.durable_job_id {
            if let Err(e) = self.store.mark_running(id).await {
                warn!(
                    job_id = %id,
                    job_type = %item.job_type,
                    error = %e,
                    "failed to record running transition"
                );
            }
            return Some(id);
        }

        // Lazy path: first execution of a repeatable job. This is the only
        // place durable records are created inside the subsystem.
        let job = Job::new(
            item.job_type,
            item.tenant_id().map(|t| t.to_string()),
        );
        let id = job.id;
        if let Err(e) = self.store.insert(&job).await {
            warn!(
                job_type = %item.job_type,
                error = %e,
                "failed to create durable record; status tracking skipped for this attempt"
            );
            return None;
        }
        if let Err(e) = self.store.mark_running(id).await {
            warn!(job_id = %id, error = %e, "failed to record running transition");
        }
        // Record the id on the broker's copy so redelivery after a failed
        // attempt does not create a second record.
        if let Err(e) = self.broker.set_durable_job_id(item.id, id).await {
            warn!(
                item_id = %item.id,
                job_id = %id,
                error = %e,
                "failed to link durable record to broker item"
            );
        }
        debug!(job_id = %id, job_type = %item.job_type, "durable record created lazily");
        Some(id)
    }

    /// Persist one settlement event. Non-terminal failures (attempts remain)
    /// are the broker's business and touch nothing here.
    pub async fn handle_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Completed { item, result } => {
                let Some(id) = item.durable_job_id else {
                    // A job that settles without ever reporting Running has
                    // nothing to update; not expected under normal scheduling.
                    debug!(item_id = %item.id, "completed item carries no durable id, skipping");
                    return;
                };
                if let Err(e) = self.store.mark_completed(id, result.clone()).await {
                    warn!(job_id = %id, error = %e, "failed to record completion");
                } else {
                    info!(
                        job_id = %id,
                        job_type = %item.job_type,
                        tenant_id = item.tenant_id().unwrap_or("-"),
                        attempts = item.attempts_made,
                        "job completed"
                    );
                }
            }
            QueueEvent::Failed { item, error } => {
                if !item.attempts_exhausted() {
                    return;
                }
                let Some(id) = item.durable_job_id else {
                    debug!(item_id = %item.id, "failed item carries no durable id, skipping");
                    return;
                };
                if let Err(e) = self.store.mark_failed(id, error).await {
                    warn!(job_id = %id, error = %e, "failed to record terminal failure");
                } else {
                    info!(
                        job_id = %id,
                        job_type = %item.job_type,
                        tenant_id = item.tenant_id().unwrap_or("-"),
                        attempts = item.attempts_made,
                        error = %error,
                        "job failed terminally"
                    );
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
                    warn!(missed, "status recorder lagged behind broker events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
