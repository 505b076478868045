use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use ledgerline_core::{AccountId, LedgerCurrency};
use ledgerline_infra::jobs::{
    InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobStore,
    PostgresJobStore, TransferQueue,
};
use ledgerline_infra::store::{
    InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError, apply_schema,
};
use ledgerline_infra::{AccountBalance, EngineConfig, TransferEngine};

use crate::config::ApiConfig;

pub type SharedLedgerStore = Arc<dyn LedgerStore>;
pub type SharedJobStore = Arc<dyn JobStore>;
pub type SharedEngine = Arc<TransferEngine<SharedLedgerStore>>;

/// Everything a request handler needs: the ledger for balance reads and the
/// queue for accepting transfers. The engine itself only runs inside the
/// executor.
pub struct AppServices {
    ledger: SharedLedgerStore,
    engine: SharedEngine,
    queue: TransferQueue<SharedJobStore>,
    currency: LedgerCurrency,
    executor: JobExecutorConfig,
}

impl AppServices {
    pub fn new(ledger: SharedLedgerStore, jobs: SharedJobStore, config: &ApiConfig) -> Self {
        let engine = Arc::new(TransferEngine::with_config(
            ledger.clone(),
            EngineConfig::default().with_currency(config.currency.clone()),
        ));
        Self {
            ledger,
            engine,
            queue: TransferQueue::new(jobs, config.retry_policy.clone()),
            currency: config.currency.clone(),
            executor: config.executor.clone(),
        }
    }

    pub fn in_memory(config: &ApiConfig) -> Self {
        let jobs = Arc::new(InMemoryJobStore::new().with_retention(config.job_retention));
        Self::new(InMemoryLedgerStore::arc(), jobs, config)
    }

    pub fn queue(&self) -> &TransferQueue<SharedJobStore> {
        &self.queue
    }

    pub fn currency(&self) -> &LedgerCurrency {
        &self.currency
    }

    pub async fn balance(&self, account_id: AccountId) -> Result<AccountBalance, StoreError> {
        AccountBalance::load(self.ledger.as_ref(), account_id, &self.currency).await
    }

    /// Start the background workers that drain the transfer queue.
    pub fn spawn_executor(&self) -> JobExecutorHandle {
        JobExecutor::new(
            self.queue.store().clone(),
            self.engine.clone(),
            self.executor.clone(),
        )
        .spawn()
    }
}

/// Wire stores according to `USE_PERSISTENT_STORES`.
pub async fn build_services(config: &ApiConfig) -> anyhow::Result<AppServices> {
    if !config.use_persistent_stores {
        tracing::info!("using in-memory ledger and job stores");
        return Ok(AppServices::in_memory(config));
    }

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for persistent stores")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;

    apply_schema(&pool)
        .await
        .context("failed to apply ledger schema")?;

    tracing::info!("using postgres ledger and job stores");
    let ledger: SharedLedgerStore = Arc::new(PostgresLedgerStore::new(pool.clone()));
    let jobs: SharedJobStore =
        Arc::new(PostgresJobStore::new(pool).with_retention(config.job_retention));
    Ok(AppServices::new(ledger, jobs, config))
}
