//! # Switchyard
//!
//! Background job orchestration and distributed coordination for a
//! multi-tenant content platform: named queues, bounded-concurrency worker
//! pools, durable job status, per-tenant dedup, and time-boxed distributed
//! locks.
//!
//! ## Features
//!
//! - **Named queues**: a closed [`JobType`] taxonomy routed onto six queues
//!   with static, startup-validated topology
//! - **Worker pools**: one bounded-concurrency pull loop per queue with
//!   graceful drain on shutdown
//! - **Durable job status**: every lifecycle transition mirrored into a
//!   long-lived job store, best-effort and never blocking the work itself
//! - **Per-tenant dedup**: at most one outstanding job per (tenant, job-type)
//!   pair, released deterministically on terminal outcomes
//! - **Distributed locks**: atomic set-if-absent acquisition with
//!   token-checked release, for singleton periodic operations
//! - **At-least-once delivery**: bounded retries with backoff; handlers are
//!   required to be idempotent
//! - **Async/await**: built on Tokio for I/O-bound handler workloads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchyard::{
//!     Broker, DedupController, EnqueueOptions, HandlerRegistry, JobStatusRecorder, JobType,
//!     MemoryBroker, MemoryCoordinationStore, MemoryJobStore, QueueRegistry, Worker,
//!     WorkerPool, registry::default_topology,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> switchyard::Result<()> {
//!     let coordination = Arc::new(MemoryCoordinationStore::new());
//!     let broker = Arc::new(MemoryBroker::new());
//!     let store = Arc::new(MemoryJobStore::new());
//!
//!     let recorder = Arc::new(JobStatusRecorder::new(store, broker.clone()));
//!     let dedup = Arc::new(DedupController::new(coordination));
//!     let registry = QueueRegistry::new(broker.clone(), dedup.clone(), default_topology())?;
//!
//!     let handlers = Arc::new(HandlerRegistry::new().register(
//!         JobType::SiteScan,
//!         Arc::new(|item| {
//!             Box::pin(async move {
//!                 // Your scan logic here
//!                 Ok(json!({"scanned": item.payload["tenantId"]}))
//!             })
//!         }),
//!     ));
//!
//!     let mut pool = WorkerPool::new();
//!     for queue in switchyard::QueueName::ALL {
//!         let worker = Worker::new(broker.clone(), recorder.clone(), handlers.clone(), queue)
//!             .with_concurrency(registry.concurrency(queue));
//!         pool.add_worker(worker);
//!     }
//!     pool.start();
//!
//!     // Wire settlement events into status recording and dedup release.
//!     let recorder_events = broker.subscribe();
//!     tokio::spawn(async move { recorder.run(recorder_events).await });
//!     let dedup_events = broker.subscribe();
//!     tokio::spawn(async move { dedup.run(dedup_events).await });
//!
//!     registry
//!         .enqueue_deduped(
//!             JobType::SiteScan,
//!             json!({"tenantId": "t1"}),
//!             EnqueueOptions::default().with_attempts(3),
//!         )
//!         .await?;
//!
//!     pool.shutdown().await
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs and items
//!
//! A [`Job`] is the durable record operators see: status, timestamps, result
//! or error. A [`QueueItem`] is the broker's in-flight entry. They are linked
//! by the item's `durable_job_id`; repeatable jobs get their record lazily on
//! first execution.
//!
//! ### Coordination
//!
//! Dedup keys and locks live in a shared [`CoordinationStore`]
//! (in-memory, or Redis with the `redis-store` feature). Everything
//! correctness-relevant goes through its two atomic primitives:
//! conditional set and token-checked delete.
//!
//! ### Delivery semantics
//!
//! At-least-once with idempotent dedup at the application layer. The broker
//! retries failed attempts with backoff up to the item's attempt budget;
//! only exhaustion settles a failure terminally.
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL-backed durable job store
//! - `redis-store` - Redis-backed coordination store

pub mod broker;
pub mod config;
pub mod coordination;
pub mod dedup;
pub mod error;
pub mod job;
pub mod lock;
pub mod monitor;
pub mod recorder;
pub mod registry;
pub mod shutdown;
pub mod stats;
pub mod store;
pub mod worker;

pub use broker::{BackoffPolicy, Broker, MemoryBroker, QueueEvent};
pub use config::OrchestratorConfig;
pub use coordination::{CoordinationStore, MemoryCoordinationStore};
pub use dedup::DedupController;
pub use error::SwitchyardError;
pub use job::{Job, JobId, JobStatus, JobType, ItemId, QueueItem, QueueName, TENANT_ALL};
pub use lock::{LockGuard, LockService};
pub use monitor::MemoryMonitor;
pub use recorder::JobStatusRecorder;
pub use registry::{EnqueueOptions, QueueRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownHandle};
pub use stats::{FleetTotals, ItemState, QueueCounts};
pub use store::{JobStore, MemoryJobStore};
pub use worker::{HandlerRegistry, JobHandler, Worker, WorkerPool};

#[cfg(feature = "redis-store")]
pub use coordination::RedisCoordinationStore;

#[cfg(feature = "postgres")]
pub use store::PostgresJobStore;

/// Convenient type alias for Results with [`SwitchyardError`] as the error
/// type.
pub type Result<T> = std::result::Result<T, SwitchyardError>;
