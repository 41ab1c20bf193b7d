//! Job taxonomy and record types.
//!
//! Two views of the same unit of work exist side by side:
//!
//! - [`Job`] is the durable record kept in the job store for operators:
//!   status, timestamps, result or error, attempt count. It outlives the
//!   broker's in-flight state.
//! - [`QueueItem`] is the broker's in-flight entry: the payload plus the
//!   delivery bookkeeping (attempts made, max attempts). It is destroyed
//!   according to broker retention once it settles.
//!
//! The two are linked by [`QueueItem::durable_job_id`]. Items enqueued by a
//! producer that pre-created a durable record carry the id from the start;
//! repeatable jobs get one lazily on their first `Running` transition.

use crate::error::SwitchyardError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type JobId = Uuid;

/// Broker-assigned identity of an in-flight item, distinct from [`JobId`].
pub type ItemId = Uuid;

/// Sentinel tenant id for fan-out jobs that span every tenant.
///
/// Fan-out jobs are exempt from per-tenant dedup.
pub const TENANT_ALL: &str = "all";

/// Named queues the platform routes work onto. Topology is static: every
/// [`JobType`] maps to exactly one queue via [`JobType::queue`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Content,
    Seo,
    Analytics,
    AbTest,
    Social,
    Microsite,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::Content,
        QueueName::Seo,
        QueueName::Analytics,
        QueueName::AbTest,
        QueueName::Social,
        QueueName::Microsite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Content => "content",
            QueueName::Seo => "seo",
            QueueName::Analytics => "analytics",
            QueueName::AbTest => "ab_test",
            QueueName::Social => "social",
            QueueName::Microsite => "microsite",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(QueueName::Content),
            "seo" => Ok(QueueName::Seo),
            "analytics" => Ok(QueueName::Analytics),
            "ab_test" => Ok(QueueName::AbTest),
            "social" => Ok(QueueName::Social),
            "microsite" => Ok(QueueName::Microsite),
            other => Err(SwitchyardError::Queue {
                message: format!("unknown queue name: {}", other),
            }),
        }
    }
}

/// Closed set of job categories the orchestrator runs.
///
/// Producers and handlers are keyed by this enum rather than free-form
/// strings, so an unregistered job type is a compile error at the dispatch
/// site instead of silently dropped work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ContentRefresh,
    SiteScan,
    AnalyticsSync,
    AbTestRollover,
    SocialPost,
    MicrositeBuild,
    LinkBuild,
    RoadmapScan,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::ContentRefresh,
        JobType::SiteScan,
        JobType::AnalyticsSync,
        JobType::AbTestRollover,
        JobType::SocialPost,
        JobType::MicrositeBuild,
        JobType::LinkBuild,
        JobType::RoadmapScan,
    ];

    /// The queue that owns this job type. Static topology, defined once here.
    pub fn queue(&self) -> QueueName {
        match self {
            JobType::ContentRefresh => QueueName::Content,
            JobType::SiteScan => QueueName::Seo,
            JobType::RoadmapScan => QueueName::Seo,
            JobType::AnalyticsSync => QueueName::Analytics,
            JobType::AbTestRollover => QueueName::AbTest,
            JobType::SocialPost => QueueName::Social,
            JobType::LinkBuild => QueueName::Social,
            JobType::MicrositeBuild => QueueName::Microsite,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ContentRefresh => "content_refresh",
            JobType::SiteScan => "site_scan",
            JobType::AnalyticsSync => "analytics_sync",
            JobType::AbTestRollover => "ab_test_rollover",
            JobType::SocialPost => "social_post",
            JobType::MicrositeBuild => "microsite_build",
            JobType::LinkBuild => "link_build",
            JobType::RoadmapScan => "roadmap_scan",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content_refresh" => Ok(JobType::ContentRefresh),
            "site_scan" => Ok(JobType::SiteScan),
            "analytics_sync" => Ok(JobType::AnalyticsSync),
            "ab_test_rollover" => Ok(JobType::AbTestRollover),
            "social_post" => Ok(JobType::SocialPost),
            "microsite_build" => Ok(JobType::MicrositeBuild),
            "link_build" => Ok(JobType::LinkBuild),
            "roadmap_scan" => Ok(JobType::RoadmapScan),
            other => Err(SwitchyardError::UnknownJobType {
                job_type: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(SwitchyardError::Queue {
                message: format!("unknown job status: {}", other),
            }),
        }
    }
}

/// Durable job record. Mutated only by the status recorder; never deleted by
/// this subsystem.
///
/// Invariants: `completed_at` is set iff the status is terminal; `started_at`
/// is set iff the job has ever been `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub queue: QueueName,
    pub status: JobStatus,
    /// `None` for fan-out jobs that are not scoped to a single tenant.
    pub tenant_id: Option<String>,
    pub attempts: i32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_type: JobType, tenant_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            queue: job_type.queue(),
            status: JobStatus::Pending,
            tenant_id,
            attempts: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// In-flight broker entry. Owned exclusively by the broker for its lifetime;
/// workers observe it via pull and lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// Deliveries started so far, including the current one once pulled.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Link to the durable record, if one exists yet.
    pub durable_job_id: Option<JobId>,
}

impl QueueItem {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            attempts_made: 0,
            max_attempts: 1,
            enqueued_at: Utc::now(),
            durable_job_id: None,
        }
    }

    /// Tenant the payload is scoped to, if any.
    pub fn tenant_id(&self) -> Option<&str> {
        self.payload.get("tenantId").and_then(|v| v.as_str())
    }

    /// True once the broker will no longer redeliver this item after a
    /// failure.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}
