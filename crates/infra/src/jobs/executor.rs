//! Job executor with retry and backoff logic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ledgerline_accounting::TransferRequest;

use crate::engine::TransferReceipt;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobError, JobId, JobStatus};

/// Executes the payload of a claimed job.
///
/// `attempt` starts at 1. On later attempts an earlier one may already have
/// committed without its result being recorded.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        request: &TransferRequest,
        attempt: u32,
    ) -> Result<TransferReceipt, JobError>;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(
        &self,
        request: &TransferRequest,
        attempt: u32,
    ) -> Result<TransferReceipt, JobError> {
        (**self).handle(request, attempt).await
    }
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often an idle worker polls for new jobs
    pub poll_interval: Duration,
    /// Number of worker tasks
    pub workers: usize,
    /// Name for logging
    pub name: String,
    /// Keep completed jobs so their result stays pollable
    pub retain_completed: bool,
    /// How long a claim holds before another worker may take the job over
    pub lease: Duration,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 4,
            name: "transfer-executor".to_string(),
            retain_completed: true,
            lease: Duration::from_secs(30),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retain_completed(mut self, retain: bool) -> Self {
        self.retain_completed = retain;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    running: AtomicUsize,
}

impl StatsCounters {
    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Completed { .. } => &self.succeeded,
            JobOutcome::Retrying { .. } => &self.retried,
            JobOutcome::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to a job after one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { job_id: JobId },
    /// Failed but requeued with backoff.
    Retrying { job_id: JobId, attempt: u32 },
    /// Failed terminally.
    Failed { job_id: JobId, error: JobError },
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<StatsCounters>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "job worker panicked");
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot()
    }
}

/// Background job executor.
///
/// Polls a job store for ready jobs, runs them through the handler, and
/// records completion, backoff rescheduling or terminal failure.
pub struct JobExecutor<S, H> {
    store: S,
    handler: H,
    config: JobExecutorConfig,
    stats: Arc<StatsCounters>,
}

impl<S, H> JobExecutor<S, H>
where
    S: JobStore + 'static,
    H: JobHandler + 'static,
{
    pub fn new(store: S, handler: H, config: JobExecutorConfig) -> Self {
        Self {
            store,
            handler,
            config,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot()
    }

    /// Claim and execute at most one job. Returns None when nothing is ready.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, JobStoreError> {
        let Some(mut job) = self.store.claim_next(self.config.lease).await? else {
            return Ok(None);
        };

        debug!(
            executor = %self.config.name,
            job_id = %job.id,
            attempt = job.attempt,
            "claimed job"
        );

        self.stats.running.fetch_add(1, Ordering::Relaxed);
        let outcome = self.execute(&mut job).await;
        self.stats.running.fetch_sub(1, Ordering::Relaxed);

        let outcome = outcome?;
        self.stats.record(&outcome);
        Ok(Some(outcome))
    }

    async fn execute(&self, job: &mut Job) -> Result<JobOutcome, JobStoreError> {
        let started = Utc::now();

        match self.handler.handle(&job.request, job.attempt).await {
            Ok(receipt) => {
                let transaction_id = receipt.transaction.id;
                job.mark_completed(receipt, started);
                if self.config.retain_completed {
                    self.store.update(job).await?;
                } else {
                    self.store.remove(job.id).await?;
                }
                info!(
                    executor = %self.config.name,
                    job_id = %job.id,
                    transaction_id = %transaction_id,
                    attempt = job.attempt,
                    "transfer job completed"
                );
                Ok(JobOutcome::Completed { job_id: job.id })
            }
            Err(err) => {
                let rescheduled = job.mark_failed(err.clone(), started);
                self.store.update(job).await?;

                if rescheduled {
                    warn!(
                        executor = %self.config.name,
                        job_id = %job.id,
                        attempt = job.attempt,
                        max_attempts = job.retry_policy.max_attempts,
                        scheduled_at = ?job.scheduled_at,
                        error = %err,
                        "transfer job failed, retry scheduled"
                    );
                    Ok(JobOutcome::Retrying {
                        job_id: job.id,
                        attempt: job.attempt,
                    })
                } else {
                    warn!(
                        executor = %self.config.name,
                        job_id = %job.id,
                        attempt = job.attempt,
                        error = %err,
                        "transfer job failed"
                    );
                    debug_assert_eq!(job.status, JobStatus::Failed);
                    Ok(JobOutcome::Failed {
                        job_id: job.id,
                        error: err,
                    })
                }
            }
        }
    }

    /// Spawn `workers` tokio tasks that poll until shutdown.
    pub fn spawn(self) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let workers = self.config.workers.max(1);
        let executor = Arc::new(self);

        let handles = (0..workers)
            .map(|worker| {
                let executor = executor.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { executor.worker_loop(worker, shutdown).await })
            })
            .collect();

        JobExecutorHandle {
            shutdown: shutdown_tx,
            workers: handles,
            stats,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(executor = %self.config.name, worker, "job worker started");

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(
                        executor = %self.config.name,
                        worker,
                        error = %e,
                        "failed to process job"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(executor = %self.config.name, worker, "job worker stopped");
    }
}
