use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use ledgerline_accounting::{Account, Entry, EntryTotals, Posting, Transaction};
use ledgerline_core::{AccountId, TransactionId};

use super::r#trait::{IDEMPOTENCY_KEY_CONSTRAINT, LedgerStore, StoreError, UnitOfWork};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<TransactionId, Transaction>,
    idempotency_keys: HashMap<String, TransactionId>,
    entries: Vec<Entry>,
}

impl LedgerState {
    fn totals_for(&self, account_id: AccountId) -> Result<EntryTotals, StoreError> {
        let totals =
            EntryTotals::from_entries(self.entries.iter().filter(|e| e.account_id == account_id))?;
        Ok(totals)
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. A unit of work holds the single ledger lock for its
/// whole lifetime, so units are fully serial (stronger than SERIALIZABLE).
/// Writes are staged in the unit and applied on commit.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    unavailable_begins: AtomicU32,
    conflicting_commits: Arc<AtomicU32>,
    lost_commit_acks: Arc<AtomicU32>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` calls to `begin` fail with `StoreError::Unavailable`.
    pub fn fail_next_begins(&self, n: u32) {
        self.unavailable_begins.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail with `StoreError::Conflict`.
    pub fn conflict_next_commits(&self, n: u32) {
        self.conflicting_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits apply their writes and then report
    /// `StoreError::Unavailable`, as when the connection drops after COMMIT.
    pub fn lose_next_commit_acks(&self, n: u32) {
        self.lost_commit_acks.store(n, Ordering::SeqCst);
    }

    /// Write a balanced posting directly, skipping the transfer engine's
    /// funds check. Used to seed opening balances in tests and dev.
    pub async fn seed_posting(&self, posting: &Posting) -> Result<(), StoreError> {
        let mut unit = self.begin().await?;
        unit.insert_transaction(posting.transaction()).await?;
        for entry in posting.entries() {
            unit.insert_entry(entry).await?;
        }
        unit.commit().await
    }

    /// Number of committed transactions.
    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

/// Decrement `counter` if positive; true when a fault should fire.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct InMemoryUnit {
    guard: OwnedMutexGuard<LedgerState>,
    transactions: Vec<Transaction>,
    entries: Vec<Entry>,
    conflicting_commits: Arc<AtomicU32>,
    lost_commit_acks: Arc<AtomicU32>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnit {
    async fn lock_account(&mut self, account_id: AccountId) -> Result<(), StoreError> {
        // The unit already owns the ledger lock; only existence is checked.
        if self.guard.accounts.contains_key(&account_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownAccount(account_id.to_string()))
        }
    }

    async fn entry_totals(&mut self, account_id: AccountId) -> Result<EntryTotals, StoreError> {
        let mut totals = self.guard.totals_for(account_id)?;
        for entry in self.entries.iter().filter(|e| e.account_id == account_id) {
            totals.record(entry.direction, entry.amount)?;
        }
        Ok(totals)
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        if let Some(key) = &transaction.idempotency_key {
            let staged = self
                .transactions
                .iter()
                .any(|t| t.idempotency_key.as_deref() == Some(key.as_str()));
            if staged || self.guard.idempotency_keys.contains_key(key) {
                return Err(StoreError::UniqueViolation {
                    constraint: IDEMPOTENCY_KEY_CONSTRAINT.to_string(),
                });
            }
        }
        if self.guard.transactions.contains_key(&transaction.id)
            || self.transactions.iter().any(|t| t.id == transaction.id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "transactions_pkey".to_string(),
            });
        }
        self.transactions.push(transaction.clone());
        Ok(())
    }

    async fn insert_entry(&mut self, entry: &Entry) -> Result<(), StoreError> {
        if !self.guard.accounts.contains_key(&entry.account_id) {
            return Err(StoreError::UnknownAccount(entry.account_id.to_string()));
        }
        let known_tx = self.guard.transactions.contains_key(&entry.transaction_id)
            || self.transactions.iter().any(|t| t.id == entry.transaction_id);
        if !known_tx {
            return Err(StoreError::Corrupt(format!(
                "entry {} references unknown transaction {}",
                entry.id, entry.transaction_id
            )));
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryUnit {
            mut guard,
            transactions,
            entries,
            conflicting_commits,
            lost_commit_acks,
        } = *self;

        if take_fault(&conflicting_commits) {
            return Err(StoreError::Conflict("injected commit conflict".to_string()));
        }

        for tx in transactions {
            if let Some(key) = &tx.idempotency_key {
                guard.idempotency_keys.insert(key.clone(), tx.id);
            }
            guard.transactions.insert(tx.id, tx);
        }
        guard.entries.extend(entries);

        if take_fault(&lost_commit_acks) {
            return Err(StoreError::Unavailable("injected lost commit ack".to_string()));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Staged writes are dropped with the unit; the guard is released here.
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        if take_fault(&self.unavailable_begins) {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(InMemoryUnit {
            guard,
            transactions: Vec::new(),
            entries: Vec::new(),
            conflicting_commits: self.conflicting_commits.clone(),
            lost_commit_acks: self.lost_commit_acks.clone(),
        }))
    }

    async fn entry_totals(&self, account_id: AccountId) -> Result<EntryTotals, StoreError> {
        self.state.lock().await.totals_for(account_id)
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .idempotency_keys
            .get(key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.state.lock().await.accounts.get(&account_id).cloned())
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.id) {
            return Err(StoreError::UniqueViolation {
                constraint: "accounts_pkey".to_string(),
            });
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn transaction_entries(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Entry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn ledger_totals(&self) -> Result<EntryTotals, StoreError> {
        Ok(EntryTotals::from_entries(&self.state.lock().await.entries)?)
    }
}
