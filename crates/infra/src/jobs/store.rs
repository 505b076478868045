//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::types::{Job, JobId, JobStatus};

/// Job store abstraction.
///
/// The queue owns only job identity, payload and status; ledger state never
/// passes through here.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Replace a stored job.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Atomically move the oldest ready queued job to `active` under a lease
    /// of `lease`, and return it. Returns None if no jobs are ready.
    ///
    /// Active jobs whose lease has lapsed are first charged a failed attempt
    /// and requeued (or failed) per their retry policy.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobStoreError>;

    /// Cancel a job that has not started executing.
    async fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Drop a job record entirely.
    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {status} and can no longer be cancelled")]
    NotCancellable { id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Active => self.active += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }
}

/// How long finished jobs stay pollable by default.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Terminal jobs last touched before `now - retention`.
pub(super) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// In-memory job store for tests/dev.
///
/// Finished jobs are dropped once they are older than the retention window;
/// pruning happens as part of `claim_next`.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    retention: Duration,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self {
            jobs: RwLock::default(),
            retention: DEFAULT_JOB_RETENTION,
        }
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;

        let now = Utc::now();
        for job in jobs.values_mut().filter(|j| j.is_stalled(now)) {
            let requeued = job.mark_stalled();
            warn!(job_id = %job.id, attempt = job.attempt, requeued, "job lease expired");
        }

        let cutoff = retention_cutoff(now, self.retention);
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < cutoff));
        if jobs.len() < before {
            debug!(pruned = before - jobs.len(), "pruned finished jobs");
        }

        // Oldest ready job first (FIFO by creation).
        let now = Utc::now();
        let next = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_active(lease);
                job.clone()
            })
        }))
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Queued {
            return Err(JobStoreError::NotCancellable {
                id: job_id,
                status: job.status,
            });
        }
        job.mark_cancelled();
        Ok(job.clone())
    }

    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.write()?
            .remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.read()?.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(lease).await
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).cancel(job_id).await
    }

    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).remove(job_id).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::{JobError, RetryPolicy};
    use ledgerline_accounting::TransferRequest;
    use ledgerline_core::{AccountId, Money};

    const LEASE: Duration = Duration::from_secs(30);

    fn job() -> Job {
        Job::new(TransferRequest::new(
            AccountId::new(),
            AccountId::new(),
            Money::parse("2.50").unwrap(),
            "test",
        ))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();

        let job_id = store.enqueue(job()).await.unwrap();

        let claimed = store.claim_next(LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(store.claim_next(LEASE).await.unwrap().is_none());
        assert_eq!(store.get(job_id).await.unwrap().unwrap().status, JobStatus::Active);
    }

    #[tokio::test]
    async fn claims_are_fifo() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job()).await.unwrap();
        let second = store.enqueue(job()).await.unwrap();

        assert_eq!(store.claim_next(LEASE).await.unwrap().unwrap().id, first);
        assert_eq!(store.claim_next(LEASE).await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn backed_off_job_is_not_claimable_yet() {
        let store = InMemoryJobStore::new();
        let j = job().with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60)));
        store.enqueue(j).await.unwrap();

        let mut claimed = store.claim_next(LEASE).await.unwrap().unwrap();
        let down = JobError::new("storage_unavailable", "down", true);
        claimed.mark_failed(down, Utc::now());
        store.update(&claimed).await.unwrap();

        assert!(store.claim_next(LEASE).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn only_queued_jobs_cancel() {
        let store = InMemoryJobStore::new();
        let queued = store.enqueue(job()).await.unwrap();
        let cancelled = store.cancel(queued).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(store.claim_next(LEASE).await.unwrap().is_none());

        let running = store.enqueue(job()).await.unwrap();
        store.claim_next(LEASE).await.unwrap();
        assert!(matches!(
            store.cancel(running).await,
            Err(JobStoreError::NotCancellable { status: JobStatus::Active, .. })
        ));
        assert!(matches!(
            store.cancel(JobId::new()).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();

        for _ in 0..5 {
            store.enqueue(job()).await.unwrap();
        }
        assert_eq!(store.stats().await.unwrap().queued, 5);

        store.claim_next(LEASE).await.unwrap();
        store.claim_next(LEASE).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.active, 2);
    }

    #[tokio::test]
    async fn abandoned_claim_is_reclaimed_after_lease_expires() {
        let store = InMemoryJobStore::new();
        let id = store
            .enqueue(job().with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO)))
            .await
            .unwrap();

        // A claim that is never resolved, as after a worker crash.
        let abandoned = store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(abandoned.attempt, 1);

        let reclaimed = store.claim_next(LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.status, JobStatus::Active);
        assert_eq!(reclaimed.attempt, 2);
        assert_eq!(reclaimed.history.len(), 1);
        assert_eq!(reclaimed.history[0].error.as_ref().unwrap().kind, "lease_expired");

        // Within its lease the job belongs to the current worker.
        assert!(store.claim_next(LEASE).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn repeatedly_abandoned_job_fails_at_attempt_cap() {
        let store = InMemoryJobStore::new();
        let id = store
            .enqueue(job().with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO)))
            .await
            .unwrap();

        store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(store.claim_next(LEASE).await.unwrap().is_none());

        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt, 2);
        assert!(failed.lease_expires_at.is_none());
        assert_eq!(failed.error.unwrap().kind, "lease_expired");
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_after_retention() {
        let store = InMemoryJobStore::new().with_retention(Duration::from_secs(60));
        let old = store.enqueue(job()).await.unwrap();
        let fresh = store.enqueue(job()).await.unwrap();
        let pending = store.enqueue(job()).await.unwrap();

        let mut cancelled = store.cancel(old).await.unwrap();
        cancelled.updated_at = Utc::now() - chrono::Duration::minutes(5);
        store.update(&cancelled).await.unwrap();
        store.cancel(fresh).await.unwrap();

        assert_eq!(store.claim_next(LEASE).await.unwrap().unwrap().id, pending);
        assert!(store.get(old).await.unwrap().is_none());
        assert!(store.get(fresh).await.unwrap().is_some());
        assert!(store.get(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_and_remove_require_existing_job() {
        let store = InMemoryJobStore::new();
        let j = job();
        assert!(matches!(store.update(&j).await, Err(JobStoreError::NotFound(_))));

        let id = store.enqueue(j.clone()).await.unwrap();
        assert!(matches!(store.enqueue(j).await, Err(JobStoreError::AlreadyExists(_))));
        store.remove(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
    }
}
