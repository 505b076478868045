//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledgerline_accounting::TransferRequest;

use crate::engine::TransferReceipt;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job execution status.
///
/// `queued -> active -> completed | failed`. A failed attempt with attempts
/// left goes back to `queued` with a backoff `scheduled_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            other => Err(format!(
                "unknown backoff strategy '{other}' (expected fixed, exponential or linear)"
            )),
        }
    }
}

/// Which failures the retry policy reschedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    /// Only failures the handler tagged as retryable.
    #[default]
    TransientOnly,
    /// Every failure, up to the attempt cap.
    All,
}

impl std::str::FromStr for RetryScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transient" | "transient_only" => Ok(RetryScope::TransientOnly),
            "all" => Ok(RetryScope::All),
            other => Err(format!(
                "unknown retry scope '{other}' (expected transient or all)"
            )),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub scope: RetryScope,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Fixed,
            scope: RetryScope::TransientOnly,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            scope: RetryScope::TransientOnly,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            scope: RetryScope::TransientOnly,
        }
    }

    pub fn with_scope(mut self, scope: RetryScope) -> Self {
        self.scope = scope;
        self
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
            BackoffStrategy::Linear => self
                .base_delay
                .checked_mul(attempt)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        }
    }

    /// Whether a job that just failed `attempt` with `error` runs again.
    pub fn should_retry(&self, attempt: u32, error: &JobError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match self.scope {
            RetryScope::All => true,
            RetryScope::TransientOnly => error.retryable,
        }
    }
}

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Stable machine-readable tag, e.g. `insufficient_funds`.
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<JobError>,
    pub duration_ms: u64,
}

/// A background transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub request: TransferRequest,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (backoff)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// While `active`: the claim lapses after this and the job is reclaimable
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Committed transfer, once completed
    pub result: Option<TransferReceipt>,
    /// Last failure (terminal once `status` is `failed`)
    pub error: Option<JobError>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    /// A request without an idempotency key gets `job:{id}`, so that running
    /// the job again can never post the transfer twice.
    pub fn new(mut request: TransferRequest) -> Self {
        let now = Utc::now();
        let id = JobId::new();
        if request.idempotency_key.is_none() {
            request.idempotency_key = Some(format!("job:{id}"));
        }
        Self {
            id,
            request,
            status: JobStatus::Queued,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            lease_expires_at: None,
            result: None,
            error: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_at.is_none_or(|at| now >= at)
    }

    /// Whether this job was claimed and its lease ran out without a result.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.lease_expires_at.is_some_and(|at| now >= at)
    }

    pub fn mark_active(&mut self, lease: Duration) {
        let now = Utc::now();
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.updated_at = now;
        self.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
    }

    pub fn mark_completed(&mut self, receipt: TransferReceipt, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.scheduled_at = None;
        self.lease_expires_at = None;
        self.result = Some(receipt);
        self.error = None;
        self.record_attempt(started_at, now, None);
    }

    /// Record a failed attempt. Returns true if the job was rescheduled.
    pub fn mark_failed(&mut self, error: JobError, started_at: DateTime<Utc>) -> bool {
        let now = Utc::now();
        self.updated_at = now;
        self.lease_expires_at = None;
        self.record_attempt(started_at, now, Some(error.clone()));

        let retry = self.retry_policy.should_retry(self.attempt, &error);
        if retry {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Queued;
        } else {
            self.scheduled_at = None;
            self.status = JobStatus::Failed;
        }
        self.error = Some(error);
        retry
    }

    /// Count a lapsed lease as a failed attempt. Returns true if the job was
    /// rescheduled.
    pub fn mark_stalled(&mut self) -> bool {
        let started_at = self.updated_at;
        self.mark_failed(
            JobError::new("lease_expired", "worker stopped before recording a result", true),
            started_at,
        )
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.scheduled_at = None;
        self.lease_expires_at = None;
        self.updated_at = Utc::now();
    }

    fn record_attempt(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<JobError>,
    ) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}
