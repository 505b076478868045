//! Submission/polling facade over a [`JobStore`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use ledgerline_accounting::TransferRequest;

use crate::engine::TransferReceipt;

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobError, JobId, JobStatus, RetryPolicy};

/// Returned by [`TransferQueue::enqueue`]; the transfer has not run yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: JobId,
    pub status: JobStatus,
}

impl JobHandle {
    /// Relative URL a caller polls for this job's status.
    pub fn track_url(&self) -> String {
        format!("/ledger/status/{}", self.job_id)
    }
}

/// Pollable state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<TransferReceipt>,
    pub error: Option<JobError>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            attempts: job.attempt,
            max_attempts: job.retry_policy.max_attempts,
            result: job.result,
            error: job.error,
            scheduled_at: job.scheduled_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Accepts transfer requests without executing them.
#[derive(Debug, Clone)]
pub struct TransferQueue<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S: JobStore> TransferQueue<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn enqueue(&self, request: TransferRequest) -> Result<JobHandle, JobStoreError> {
        let job = Job::new(request).with_retry_policy(self.policy.clone());
        let job_id = self.store.enqueue(job).await?;
        info!(job_id = %job_id, "transfer queued");
        Ok(JobHandle {
            job_id,
            status: JobStatus::Queued,
        })
    }

    pub async fn status(&self, job_id: JobId) -> Result<Option<JobView>, JobStoreError> {
        Ok(self.store.get(job_id).await?.map(JobView::from))
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobView, JobStoreError> {
        let job = self.store.cancel(job_id).await?;
        info!(job_id = %job_id, "transfer cancelled");
        Ok(job.into())
    }

    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats().await
    }
}
