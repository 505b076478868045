//! Transfer Engine.
//!
//! Validates a transfer, checks idempotency, and writes the balanced
//! DEBIT/CREDIT pair inside one unit of work against the [`LedgerStore`].
//!
//! Flow (per attempt):
//! 1. amount rounded to the ledger scale must be strictly positive
//! 2. an existing transaction with the idempotency key short-circuits as
//!    `DuplicateRequest`
//! 3. `begin` -> `lock_account(from)` -> balance of `from` at the unit's isolation
//! 4. insert header, DEBIT on `from`, CREDIT on `to`
//! 5. commit
//!
//! Storage conflicts (serialization failures, a concurrent writer taking the
//! idempotency key) abort the unit and rerun the whole flow up to
//! `conflict_retries` more times. The engine holds no in-process locks; all
//! consistency comes from the store's isolation.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use ledgerline_accounting::{Entry, Posting, Transaction, TransferRequest};
use ledgerline_core::{LedgerCurrency, Money, TransactionId};

use crate::balance::BalanceCalculator;
use crate::jobs::{JobError, JobHandler};
use crate::store::{LedgerStore, StoreError, UnitOfWork};

/// Why a transfer was not committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("amount must be strictly positive, got {amount}")]
    InvalidAmount { amount: String },

    /// The key was already committed. Callers treat this as "already processed".
    #[error("request with idempotency key '{key}' was already processed")]
    DuplicateRequest {
        key: String,
        transaction_id: Option<TransactionId>,
    },

    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: String, requested: String },

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("source and destination account are the same")]
    SameAccount,

    #[error("storage conflict: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl TransferError {
    /// True for failures that may succeed if the same request is run again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Conflict(_) | TransferError::StorageUnavailable(_)
        )
    }

    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount { .. } => "invalid_amount",
            TransferError::DuplicateRequest { .. } => "duplicate_request",
            TransferError::InsufficientFunds { .. } => "insufficient_funds",
            TransferError::UnknownAccount(_) => "unknown_account",
            TransferError::SameAccount => "same_account",
            TransferError::Conflict(_) => "conflict",
            TransferError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Extra attempts after a storage conflict.
    pub conflict_retries: u32,
    pub currency: LedgerCurrency,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 1,
            currency: LedgerCurrency::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_currency(mut self, currency: LedgerCurrency) -> Self {
        self.currency = currency;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }
}

/// A committed transfer: the header and its two entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub transaction: Transaction,
    pub entries: Vec<Entry>,
}

impl From<Posting> for TransferReceipt {
    fn from(posting: Posting) -> Self {
        let (transaction, entries) = posting.into_parts();
        Self {
            transaction,
            entries,
        }
    }
}

/// Outcome of one attempt: either a ledger rule said no, or the store failed.
enum AttemptError {
    Rejected(TransferError),
    Store(StoreError),
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        AttemptError::Store(err)
    }
}

#[derive(Debug, Clone)]
pub struct TransferEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: LedgerStore> TransferEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[instrument(
        skip(self, request),
        fields(
            from = %request.from_account_id,
            to = %request.to_account_id,
            amount = %request.amount,
        ),
        err
    )]
    pub async fn transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let scale = self.config.currency.scale();
        let amount = request.amount.round_to_scale(scale);
        if !amount.is_positive() {
            debug!("rejected non-positive amount");
            return Err(TransferError::InvalidAmount {
                amount: request.amount.to_string(),
            });
        }
        if request.from_account_id == request.to_account_id {
            return Err(TransferError::SameAccount);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            if let Some(key) = &request.idempotency_key {
                let existing = self
                    .store
                    .find_transaction_by_idempotency_key(key)
                    .await
                    .map_err(|e| self.classify(request, e))?;
                if let Some(tx) = existing {
                    debug!(idempotency_key = %key, transaction_id = %tx.id, "replayed request");
                    return Err(TransferError::DuplicateRequest {
                        key: key.clone(),
                        transaction_id: Some(tx.id),
                    });
                }
            }

            match self.try_post(request, amount).await {
                Ok(receipt) => {
                    info!(
                        transaction_id = %receipt.transaction.id,
                        attempt,
                        "transfer committed"
                    );
                    return Ok(receipt);
                }
                Err(AttemptError::Rejected(err)) => {
                    debug!(kind = err.kind(), attempt, "transfer rejected");
                    return Err(err);
                }
                Err(AttemptError::Store(err))
                    if is_conflict(&err) && attempt <= self.config.conflict_retries =>
                {
                    warn!(error = %err, attempt, "storage conflict, retrying transfer");
                }
                Err(AttemptError::Store(err)) => return Err(self.classify(request, err)),
            }
        }
    }

    /// One pass of steps 3-5. Any error rolls the unit back.
    async fn try_post(
        &self,
        request: &TransferRequest,
        amount: Money,
    ) -> Result<TransferReceipt, AttemptError> {
        let mut unit = self.store.begin().await?;

        match self.write_posting(unit.as_mut(), request, amount).await {
            Ok(posting) => {
                unit.commit().await?;
                Ok(posting.into())
            }
            Err(err) => {
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn write_posting(
        &self,
        unit: &mut dyn UnitOfWork,
        request: &TransferRequest,
        amount: Money,
    ) -> Result<Posting, AttemptError> {
        unit.lock_account(request.from_account_id).await?;

        let available = BalanceCalculator::balance_in(unit, request.from_account_id).await?;
        if available < amount {
            let currency = &self.config.currency;
            return Err(AttemptError::Rejected(TransferError::InsufficientFunds {
                available: currency.format(available),
                requested: currency.format(amount),
            }));
        }

        let posting = Posting::transfer(request, amount, Utc::now()).map_err(|e| {
            AttemptError::Rejected(TransferError::InvalidAmount {
                amount: e.to_string(),
            })
        })?;

        unit.insert_transaction(posting.transaction()).await?;
        for entry in posting.entries() {
            unit.insert_entry(entry).await?;
        }
        Ok(posting)
    }

    /// The committed transaction recorded under `key`, with its entries.
    pub async fn committed_receipt(
        &self,
        key: &str,
    ) -> Result<Option<TransferReceipt>, StoreError> {
        let Some(transaction) = self.store.find_transaction_by_idempotency_key(key).await? else {
            return Ok(None);
        };
        let entries = self.store.transaction_entries(transaction.id).await?;
        Ok(Some(TransferReceipt {
            transaction,
            entries,
        }))
    }

    fn classify(&self, request: &TransferRequest, err: StoreError) -> TransferError {
        match err {
            e if e.is_idempotency_violation() => TransferError::DuplicateRequest {
                key: request.idempotency_key.clone().unwrap_or_default(),
                transaction_id: None,
            },
            StoreError::UniqueViolation { constraint } => {
                TransferError::Conflict(format!("unique constraint {constraint}"))
            }
            StoreError::Conflict(msg) => TransferError::Conflict(msg),
            StoreError::UnknownAccount(id) => TransferError::UnknownAccount(id),
            StoreError::Unavailable(msg) | StoreError::Corrupt(msg) => {
                TransferError::StorageUnavailable(msg)
            }
        }
    }
}

impl From<&TransferError> for JobError {
    fn from(err: &TransferError) -> Self {
        JobError::new(err.kind(), err.to_string(), err.is_retryable())
    }
}

/// A retried job whose key is already committed finishes with that posting:
/// the earlier attempt wrote it but its result was never recorded.
#[async_trait]
impl<S: LedgerStore> JobHandler for TransferEngine<S> {
    async fn handle(
        &self,
        request: &TransferRequest,
        attempt: u32,
    ) -> Result<TransferReceipt, JobError> {
        let err = match self.transfer(request).await {
            Ok(receipt) => return Ok(receipt),
            Err(err) => err,
        };

        if let TransferError::DuplicateRequest {
            key,
            transaction_id: Some(_),
        } = &err
        {
            if attempt > 1 {
                let recovered = self
                    .committed_receipt(key)
                    .await
                    .map_err(|e| JobError::from(&self.classify(request, e)))?;
                if let Some(receipt) = recovered {
                    info!(
                        transaction_id = %receipt.transaction.id,
                        attempt,
                        "transfer committed by an earlier attempt"
                    );
                    return Ok(receipt);
                }
            }
        }
        Err(JobError::from(&err))
    }
}

fn is_conflict(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Conflict(_) | StoreError::UniqueViolation { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ledgerline_accounting::{Account, Direction};
    use ledgerline_core::AccountId;

    use crate::store::InMemoryLedgerStore;

    fn m(raw: &str) -> Money {
        Money::parse(raw).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        engine: TransferEngine<Arc<InMemoryLedgerStore>>,
        treasury: AccountId,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = InMemoryLedgerStore::arc();
            let treasury = AccountId::new();
            store
                .insert_account(&Account::new(treasury, "treasury", "USD"))
                .await
                .unwrap();
            Self {
                engine: TransferEngine::new(store.clone()),
                store,
                treasury,
            }
        }

        async fn account(&self, name: &str, opening: &str) -> AccountId {
            let id = AccountId::new();
            self.store
                .insert_account(&Account::new(id, name, "USD"))
                .await
                .unwrap();
            if opening != "0" {
                let req = TransferRequest::new(self.treasury, id, m(opening), "opening balance");
                let posting = Posting::transfer(&req, req.amount, Utc::now()).unwrap();
                self.store.seed_posting(&posting).await.unwrap();
            }
            id
        }

        async fn balance(&self, id: AccountId) -> Money {
            BalanceCalculator::balance(&self.store, id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn transfer_moves_exact_amount_and_rejects_replay() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "100.00").await;
        let b = fx.account("b", "0").await;

        let req =
            TransferRequest::new(a, b, m("40.00"), "rent").with_idempotency_key("rent-2024-05");
        let receipt = fx.engine.transfer(&req).await.unwrap();

        assert_eq!(receipt.transaction.description, "rent");
        assert_eq!(receipt.entries.len(), 2);
        assert_eq!(receipt.entries[0].direction, Direction::Debit);
        assert_eq!(receipt.entries[0].account_id, a);
        assert_eq!(receipt.entries[1].direction, Direction::Credit);
        assert_eq!(receipt.entries[1].account_id, b);
        assert_eq!(fx.balance(a).await, m("60.00"));
        assert_eq!(fx.balance(b).await, m("40.00"));

        let err = fx.engine.transfer(&req).await.unwrap_err();
        assert_eq!(
            err,
            TransferError::DuplicateRequest {
                key: "rent-2024-05".into(),
                transaction_id: Some(receipt.transaction.id),
            }
        );
        assert!(!err.is_retryable());
        assert_eq!(fx.balance(a).await, m("60.00"));

        let stored = fx.store.transaction_entries(receipt.transaction.id).await.unwrap();
        assert_eq!(stored, receipt.entries);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_invalid() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "10").await;
        let b = fx.account("b", "0").await;
        let before = fx.store.entry_count().await;

        for raw in ["0", "0.00", "-5", "0.004"] {
            let err = fx
                .engine
                .transfer(&TransferRequest::new(a, b, m(raw), "x"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_amount", "amount {raw}");
            assert!(!err.is_retryable());
        }
        assert_eq!(fx.store.entry_count().await, before);
    }

    #[tokio::test]
    async fn amount_is_rounded_half_even_to_ledger_scale() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "10").await;
        let b = fx.account("b", "0").await;

        let receipt = fx
            .engine
            .transfer(&TransferRequest::new(a, b, m("1.005"), "x"))
            .await
            .unwrap();
        assert_eq!(receipt.entries[0].amount, m("1.00"));
        assert_eq!(receipt.entries[0].amount.to_string(), "1.00");
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_no_trace() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "30.00").await;
        let b = fx.account("b", "0").await;
        let before = fx.store.transaction_count().await;

        let err = fx
            .engine
            .transfer(&TransferRequest::new(a, b, m("30.01"), "x"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::InsufficientFunds {
                available: "30.00".into(),
                requested: "30.01".into(),
            }
        );
        assert_eq!(fx.store.transaction_count().await, before);
        assert_eq!(fx.balance(a).await, m("30.00"));

        // Exactly the full balance is allowed.
        fx.engine
            .transfer(&TransferRequest::new(a, b, m("30"), "x"))
            .await
            .unwrap();
        assert!(fx.balance(a).await.is_zero());
    }

    #[tokio::test]
    async fn same_and_unknown_accounts_are_rejected() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "10").await;
        let ghost = AccountId::new();

        let err = fx
            .engine
            .transfer(&TransferRequest::new(a, a, m("1"), "x"))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::SameAccount);

        let err = fx
            .engine
            .transfer(&TransferRequest::new(ghost, a, m("1"), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnknownAccount(_)));

        let err = fx
            .engine
            .transfer(&TransferRequest::new(a, ghost, m("1"), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnknownAccount(_)));
        assert_eq!(fx.balance(a).await, m("10"));
    }

    #[tokio::test]
    async fn single_conflict_is_retried_transparently() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "10").await;
        let b = fx.account("b", "0").await;

        fx.store.conflict_next_commits(1);
        fx.engine
            .transfer(&TransferRequest::new(a, b, m("4"), "x"))
            .await
            .unwrap();
        assert_eq!(fx.balance(b).await, m("4"));

        fx.store.conflict_next_commits(2);
        let err = fx
            .engine
            .transfer(&TransferRequest::new(a, b, m("4"), "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(err.is_retryable());
        assert_eq!(fx.balance(b).await, m("4"));
    }

    #[tokio::test]
    async fn outage_surfaces_as_retryable_unavailable() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "10").await;
        let b = fx.account("b", "0").await;

        fx.store.fail_next_begins(1);
        let err = fx
            .engine
            .transfer(&TransferRequest::new(a, b, m("1"), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::StorageUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn retried_job_recovers_posting_whose_commit_ack_was_lost() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "10").await;
        let b = fx.account("b", "0").await;
        let before = fx.store.transaction_count().await;
        let req = TransferRequest::new(a, b, m("4"), "x").with_idempotency_key("job:1");

        fx.store.lose_next_commit_acks(1);
        let err = fx.engine.handle(&req, 1).await.unwrap_err();
        assert_eq!(err.kind, "storage_unavailable");
        assert!(err.retryable);

        let receipt = fx.engine.handle(&req, 2).await.unwrap();
        assert_eq!(receipt.transaction.idempotency_key.as_deref(), Some("job:1"));
        assert_eq!(receipt.entries.len(), 2);
        assert_eq!(fx.store.transaction_count().await, before + 1);
        assert_eq!(fx.balance(a).await, m("6"));
        assert_eq!(fx.balance(b).await, m("4"));
    }

    #[tokio::test]
    async fn first_attempt_on_committed_key_is_still_a_duplicate() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "10").await;
        let b = fx.account("b", "0").await;
        let req = TransferRequest::new(a, b, m("4"), "x").with_idempotency_key("k");

        fx.engine.handle(&req, 1).await.unwrap();
        let err = fx.engine.handle(&req, 1).await.unwrap_err();
        assert_eq!(err.kind, "duplicate_request");
        assert!(!err.retryable);
        assert_eq!(fx.balance(a).await, m("6"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transfers_never_overdraw() {
        const N: usize = 12;
        let fx = Fixture::new().await;
        let a = fx.account("a", &format!("{}.00", (N - 1) * 5)).await;
        let b = fx.account("b", "0").await;
        let engine = Arc::new(fx.engine.clone());

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .transfer(&TransferRequest::new(a, b, m("5.00"), format!("t{i}")))
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut insufficient = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(TransferError::InsufficientFunds { .. }) => insufficient += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }

        assert_eq!(ok, N - 1);
        assert_eq!(insufficient, 1);
        assert!(fx.balance(a).await.is_zero());
        assert_eq!(fx.balance(b).await, m(&format!("{}", (N - 1) * 5)));

        let totals = fx.store.ledger_totals().await.unwrap();
        assert_eq!(totals.debits, totals.credits);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replays_commit_once() {
        let fx = Fixture::new().await;
        let a = fx.account("a", "100").await;
        let b = fx.account("b", "0").await;
        let engine = Arc::new(fx.engine.clone());
        let before = fx.store.transaction_count().await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let req = TransferRequest::new(a, b, m("10"), "once")
                        .with_idempotency_key("same");
                    engine.transfer(&req).await
                })
            })
            .collect();

        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(TransferError::DuplicateRequest { key, .. }) => assert_eq!(key, "same"),
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(fx.store.transaction_count().await, before + 1);
        assert_eq!(fx.balance(a).await, m("90"));
    }

    #[test]
    fn job_error_carries_kind_and_retryability() {
        let err = JobError::from(&TransferError::StorageUnavailable("pool closed".into()));
        assert_eq!(err.kind, "storage_unavailable");
        assert!(err.retryable);
        assert!(err.message.contains("pool closed"));

        let err = JobError::from(&TransferError::SameAccount);
        assert!(!err.retryable);
    }

    #[test]
    fn only_storage_failures_are_retryable() {
        let caller_errors = [
            TransferError::InvalidAmount { amount: "0".into() },
            TransferError::DuplicateRequest { key: "k".into(), transaction_id: None },
            TransferError::InsufficientFunds { available: "0.00".into(), requested: "1.00".into() },
            TransferError::UnknownAccount("x".into()),
            TransferError::SameAccount,
        ];
        assert!(caller_errors.iter().all(|e| !e.is_retryable()));
        assert!(TransferError::Conflict("c".into()).is_retryable());
        assert!(TransferError::StorageUnavailable("u".into()).is_retryable());
    }
}
