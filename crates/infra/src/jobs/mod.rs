//! Background transfer queue with retry and backoff.
//!
//! ## Design
//!
//! - A job carries one `TransferRequest` and moves through
//!   `queued -> active -> completed | failed` (or `cancelled` while queued)
//! - Failed attempts are requeued with backoff while the retry policy allows
//! - The retry scope decides whether non-retryable (caller) errors are retried
//! - Completed jobs keep their result so callers can poll it
//!
//! ## Components
//!
//! - `Job`: job record with payload, status and attempt history
//! - `JobStore`: persistence for jobs (in-memory or Postgres)
//! - `JobExecutor`: worker tasks that claim and run jobs through a `JobHandler`
//! - `TransferQueue`: enqueue / status / cancel facade

pub mod executor;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler, JobOutcome,
};
pub use postgres::PostgresJobStore;
pub use queue::{JobHandle, JobView, TransferQueue};
pub use store::{DEFAULT_JOB_RETENTION, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, Job, JobAttemptRecord, JobError, JobId, JobStatus, RetryPolicy, RetryScope,
};
