use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use ledgerline_accounting::{Account, Entry, EntryTotals, Transaction};
use ledgerline_core::{AccountId, DomainError, TransactionId};

/// Name of the uniqueness constraint on `transactions.idempotency_key`.
///
/// Both adapters report a duplicate key on insert with this constraint name,
/// which is how the engine tells a replay apart from other unique violations.
pub const IDEMPOTENCY_KEY_CONSTRAINT: &str = "transactions_idempotency_key_key";

/// Ledger store operation error.
///
/// These are **infrastructure errors** (isolation, constraints, connectivity).
/// Ledger rules (sufficient funds, positive amounts) are decided by the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The unit of work lost a serialization race (or deadlocked) and was aborted.
    #[error("serialization conflict: {0}")]
    Conflict(String),

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// Referenced account does not exist.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// Connection, pool or IO failure. Usually transient.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_idempotency_violation(&self) -> bool {
        matches!(
            self,
            StoreError::UniqueViolation { constraint } if constraint == IDEMPOTENCY_KEY_CONSTRAINT
        )
    }
}

/// Entry sums that no longer fit a `Money` mean the stored ledger is unusable.
impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// One atomic unit of work against the ledger.
///
/// Everything done through a unit is observed at the unit's isolation level and
/// becomes visible only on `commit`. `rollback` discards it; so does dropping
/// the unit without committing, so every exit path releases the unit's locks.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Serialise against concurrent writers of `account_id`'s entries.
    ///
    /// Fails with `UnknownAccount` if the account does not exist.
    async fn lock_account(&mut self, account_id: AccountId) -> Result<(), StoreError>;

    /// Per-direction entry sums for an account, as seen by this unit
    /// (including its own uncommitted writes).
    async fn entry_totals(&mut self, account_id: AccountId) -> Result<EntryTotals, StoreError>;

    /// Insert a transaction header. A duplicate idempotency key is reported as
    /// `UniqueViolation { constraint: IDEMPOTENCY_KEY_CONSTRAINT }`.
    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError>;

    async fn insert_entry(&mut self, entry: &Entry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Transactional persistence over accounts, transactions and entries.
///
/// The store is the single source of truth for ledger state: callers never
/// cache balances, and all locking is delegated to the unit of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a unit of work at the strongest isolation the backend offers.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Per-direction entry sums for an account, read outside any unit.
    async fn entry_totals(&self, account_id: AccountId) -> Result<EntryTotals, StoreError>;

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Register an account. Accounts are created out-of-band; this exists for
    /// bootstrap and tests, never for the transfer path.
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn transaction_entries(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Entry>, StoreError>;

    /// Entry sums across the whole ledger (closure check: debits == credits).
    async fn ledger_totals(&self) -> Result<EntryTotals, StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        (**self).begin().await
    }

    async fn entry_totals(&self, account_id: AccountId) -> Result<EntryTotals, StoreError> {
        (**self).entry_totals(account_id).await
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        (**self).find_transaction_by_idempotency_key(key).await
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        (**self).get_account(account_id).await
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        (**self).insert_account(account).await
    }

    async fn transaction_entries(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Entry>, StoreError> {
        (**self).transaction_entries(transaction_id).await
    }

    async fn ledger_totals(&self) -> Result<EntryTotals, StoreError> {
        (**self).ledger_totals().await
    }
}
