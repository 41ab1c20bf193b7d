//! Durable job store: the long-lived record of job history, independent of
//! the broker's in-flight state.
//!
//! Written from exactly one place (the status recorder) to avoid conflicting
//! writers. The in-memory implementation backs tests and single-process
//! deployments; the PostgreSQL implementation lives behind the `postgres`
//! feature.

use crate::{
    Result,
    job::{Job, JobId, JobStatus},
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Transition to Running: bump attempts, set `started_at` on the first
    /// call only.
    async fn mark_running(&self, id: JobId) -> Result<()>;

    /// Terminal success: set `completed_at` and the result payload.
    async fn mark_completed(&self, id: JobId, result: serde_json::Value) -> Result<()>;

    /// Terminal failure: set `completed_at` and the error message.
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<()>;

    /// Bounded listing of recent records in one status, newest first.
    async fn recent_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>>;
}

/// In-memory job store.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Total number of records, for test assertions.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: JobId) -> crate::error::SwitchyardError {
    crate::error::SwitchyardError::JobNotFound { id: id.to_string() }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn mark_running(&self, id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.status = JobStatus::Running;
        job.attempts += 1;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_completed(&self, id: JobId, result: serde_json::Value) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn recent_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresJobStore;

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use crate::job::{JobType, QueueName};
    use chrono::{DateTime, Utc};
    use sqlx::{FromRow, PgPool};

    #[derive(FromRow)]
    struct JobRow {
        id: uuid::Uuid,
        job_type: String,
        queue_name: String,
        status: String,
        tenant_id: Option<String>,
        attempts: i32,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    }

    impl JobRow {
        fn into_job(self) -> Result<Job> {
            Ok(Job {
                id: self.id,
                job_type: self.job_type.parse::<JobType>()?,
                queue: self.queue_name.parse::<QueueName>()?,
                status: self.status.parse::<JobStatus>()?,
                tenant_id: self.tenant_id,
                attempts: self.attempts,
                result: self.result,
                error: self.error_message,
                created_at: self.created_at,
                started_at: self.started_at,
                completed_at: self.completed_at,
            })
        }
    }

    /// PostgreSQL-backed job store.
    pub struct PostgresJobStore {
        pool: PgPool,
    }

    impl PostgresJobStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        /// Create the jobs table if it does not exist.
        pub async fn migrate(&self) -> Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS switchyard_jobs (
                    id UUID PRIMARY KEY,
                    job_type VARCHAR(64) NOT NULL,
                    queue_name VARCHAR(64) NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    tenant_id VARCHAR(255),
                    attempts INTEGER NOT NULL DEFAULT 0,
                    result JSONB,
                    error_message TEXT,
                    created_at TIMESTAMPTZ NOT NULL,
                    started_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_switchyard_jobs_status_created \
                 ON switchyard_jobs (status, created_at DESC)",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_switchyard_jobs_tenant \
                 ON switchyard_jobs (tenant_id, job_type)",
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl JobStore for PostgresJobStore {
        async fn insert(&self, job: &Job) -> Result<()> {
            sqlx::query(
                r#"
                INSERT INTO switchyard_jobs
                    (id, job_type, queue_name, status, tenant_id, attempts,
                     result, error_message, created_at, started_at, completed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(job.id)
            .bind(job.job_type.as_str())
            .bind(job.queue.as_str())
            .bind(job.status.as_str())
            .bind(&job.tenant_id)
            .bind(job.attempts)
            .bind(&job.result)
            .bind(&job.error)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>> {
            let row: Option<JobRow> = sqlx::query_as(
                r#"
                SELECT id, job_type, queue_name, status, tenant_id, attempts,
                       result, error_message, created_at, started_at, completed_at
                FROM switchyard_jobs WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(JobRow::into_job).transpose()
        }

        async fn mark_running(&self, id: JobId) -> Result<()> {
            let updated = sqlx::query(
                r#"
                UPDATE switchyard_jobs
                SET status = 'running',
                    attempts = attempts + 1,
                    started_at = COALESCE(started_at, NOW())
                WHERE id = $1
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(not_found(id));
            }
            Ok(())
        }

        async fn mark_completed(&self, id: JobId, result: serde_json::Value) -> Result<()> {
            let updated = sqlx::query(
                r#"
                UPDATE switchyard_jobs
                SET status = 'completed', result = $2, completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(result)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(not_found(id));
            }
            Ok(())
        }

        async fn mark_failed(&self, id: JobId, error: &str) -> Result<()> {
            let updated = sqlx::query(
                r#"
                UPDATE switchyard_jobs
                SET status = 'failed', error_message = $2, completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(not_found(id));
            }
            Ok(())
        }

        async fn recent_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
            let rows: Vec<JobRow> = sqlx::query_as(
                r#"
                SELECT id, job_type, queue_name, status, tenant_id, attempts,
                       result, error_message, created_at, started_at, completed_at
                FROM switchyard_jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(JobRow::into_job).collect()
        }
    }
}
