use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgerline_core::{
    AccountId, DomainError, DomainResult, Entity, EntryId, Money, TransactionId,
};

/// Side of an entry.
///
/// Balance convention: credits increase an account, debits decrease it
/// (accounts are modelled as liabilities, e.g. user wallets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "DEBIT",
            Direction::Credit => "CREDIT",
        }
    }
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Direction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(Direction::Debit),
            "CREDIT" => Ok(Direction::Credit),
            other => Err(DomainError::validation(format!("unknown direction: {other}"))),
        }
    }
}

/// Account metadata. Created out-of-band; the engine only references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    /// Ledger/currency tag, e.g. "USD".
    pub ledger: String,
}

impl Account {
    pub fn new(id: AccountId, name: impl Into<String>, ledger: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ledger: ledger.into(),
        }
    }
}

impl Entity for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Transaction header. Written once per successful transfer, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub posted_at: DateTime<Utc>,
}

impl Entity for Transaction {
    type Id = TransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// One leg of a transaction (append-only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub direction: Direction,
    /// Always positive; the direction carries the sign.
    pub amount: Money,
}

impl Entry {
    /// Contribution of this entry to its account's balance.
    pub fn signed_amount(&self) -> Money {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }
}

impl Entity for Entry {
    type Id = EntryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Per-direction sums over a set of entries (the shape of a `GROUP BY direction`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTotals {
    pub debits: Money,
    pub credits: Money,
}

impl EntryTotals {
    pub fn record(&mut self, direction: Direction, amount: Money) -> DomainResult<()> {
        match direction {
            Direction::Debit => self.debits = self.debits.checked_add(amount)?,
            Direction::Credit => self.credits = self.credits.checked_add(amount)?,
        }
        Ok(())
    }

    /// credits - debits
    pub fn balance(&self) -> Money {
        self.credits - self.debits
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> DomainResult<Self> {
        let mut totals = Self::default();
        for entry in entries {
            totals.record(entry.direction, entry.amount)?;
        }
        Ok(totals)
    }
}

/// A request to move `amount` from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Money,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl TransferRequest {
    pub fn new(
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Money,
        description: impl Into<String>,
    ) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
            description: description.into(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A balanced transaction ready to be written: header plus its entries.
///
/// Construction validates the double-entry invariant, so a `Posting` that
/// exists is always balanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    transaction: Transaction,
    entries: Vec<Entry>,
}

impl Posting {
    /// Validate a header + entries pair.
    pub fn new(transaction: Transaction, entries: Vec<Entry>) -> DomainResult<Self> {
        if entries.is_empty() {
            return Err(DomainError::validation("transaction must have entries"));
        }

        let mut totals = EntryTotals::default();
        for entry in &entries {
            if !entry.amount.is_positive() {
                return Err(DomainError::validation("entry amount must be positive"));
            }
            if entry.transaction_id != transaction.id {
                return Err(DomainError::invariant(
                    "entry belongs to a different transaction",
                ));
            }
            totals.record(entry.direction, entry.amount)?;
        }

        if totals.debits != totals.credits {
            return Err(DomainError::invariant("debits must equal credits"));
        }

        Ok(Self {
            transaction,
            entries,
        })
    }

    /// The two-leg posting of a transfer: DEBIT the source, CREDIT the target.
    pub fn transfer(
        request: &TransferRequest,
        amount: Money,
        posted_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let transaction = Transaction {
            id: TransactionId::new(),
            description: request.description.clone(),
            idempotency_key: request.idempotency_key.clone(),
            posted_at,
        };

        let debit = Entry {
            id: EntryId::new(),
            transaction_id: transaction.id,
            account_id: request.from_account_id,
            direction: Direction::Debit,
            amount,
        };
        let credit = Entry {
            id: EntryId::new(),
            transaction_id: transaction.id,
            account_id: request.to_account_id,
            direction: Direction::Credit,
            amount,
        };

        Self::new(transaction, vec![debit, credit])
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Entries in write order (debit first).
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn into_parts(self) -> (Transaction, Vec<Entry>) {
        (self.transaction, self.entries)
    }
}
