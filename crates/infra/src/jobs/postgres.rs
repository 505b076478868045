//! Postgres-backed job store (`transfer_jobs` table).
//!
//! The full job record lives in a JSONB column; `status`, `scheduled_at` and
//! the claim lease (`locked_until`) are mirrored into plain columns so claims
//! can use an index. Claims take rows with `FOR UPDATE SKIP LOCKED`, so
//! concurrent workers (in this process or others) never receive the same job
//! while its lease holds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, instrument, warn};

use super::store::{DEFAULT_JOB_RETENTION, JobStats, JobStore, JobStoreError, retention_cutoff};
use super::types::{Job, JobId, JobStatus};

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    retention: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            retention: DEFAULT_JOB_RETENTION,
        }
    }

    /// Finished jobs older than `retention` are deleted during claims.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!(
                "database error in {}: {}",
                operation,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let Json(job): Json<Job> = row
        .try_get("job")
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {}", e)))?;
    Ok(job)
}

/// Write every mirrored column plus the JSONB record.
fn update_row(job: &Job) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        UPDATE transfer_jobs
        SET status = $2, job = $3, updated_at = $4, scheduled_at = $5, locked_until = $6
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(Json(job))
    .bind(job.updated_at)
    .bind(job.scheduled_at)
    .bind(job.lease_expires_at)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_jobs (id, status, job, created_at, updated_at, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(Json(&job))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(JobStoreError::AlreadyExists(job.id))
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT job FROM transfer_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = update_row(job)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let now = Utc::now();
        let stalled = sqlx::query(
            r#"
            SELECT job
            FROM transfer_jobs
            WHERE status = 'active' AND locked_until <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        for row in &stalled {
            let mut job = decode_job(row)?;
            let requeued = job.mark_stalled();
            warn!(job_id = %job.id, attempt = job.attempt, requeued, "job lease expired");
            update_row(&job)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("claim_next", e))?;
        }

        let pruned = sqlx::query(
            r#"
            DELETE FROM transfer_jobs
            WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1
            "#,
        )
        .bind(retention_cutoff(now, self.retention))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;
        if pruned.rows_affected() > 0 {
            debug!(pruned = pruned.rows_affected(), "pruned finished jobs");
        }

        let row = sqlx::query(
            r#"
            SELECT job
            FROM transfer_jobs
            WHERE status = 'queued' AND (scheduled_at IS NULL OR scheduled_at <= $1)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let claimed = match row {
            Some(row) => {
                let mut job = decode_job(&row)?;
                job.mark_active(lease);
                update_row(&job)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("claim_next", e))?;
                Some(job)
            }
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        Ok(claimed)
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;

        let row = sqlx::query("SELECT job FROM transfer_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = decode_job(&row)?;
        if job.status != JobStatus::Queued {
            return Err(JobStoreError::NotCancellable {
                id: job_id,
                status: job.status,
            });
        }
        job.mark_cancelled();

        update_row(&job)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("cancel", e))?;
        Ok(job)
    }

    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM transfer_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM transfer_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status = status.parse::<JobStatus>().map_err(JobStoreError::Storage)?;
            stats.record(status, n.max(0) as usize);
        }
        Ok(stats)
    }
}
