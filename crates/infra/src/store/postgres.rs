//! Postgres-backed ledger store.
//!
//! Every unit of work runs at `SERIALIZABLE` and takes a row lock on the
//! source account (`SELECT ... FOR UPDATE`) before reading its balance. The
//! row lock queues concurrent debits of the same account; serializable
//! isolation catches whatever the lock does not cover.
//!
//! ## Error mapping
//!
//! | SQLx error | SQLSTATE | `StoreError` |
//! |------------|----------|--------------|
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (unique violation) | `23505` | `UniqueViolation { constraint }` |
//! | Database (foreign key violation) | `23503` | `UnknownAccount` |
//! | Database (other) | any other | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | PoolClosed / PoolTimedOut / Io / other | N/A | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::instrument;

use ledgerline_accounting::{Account, Direction, Entry, EntryTotals, Transaction};
use ledgerline_core::{AccountId, EntryId, Money, TransactionId};

use super::r#trait::{LedgerStore, StoreError, UnitOfWork};

const SCHEMA: &str = include_str!("../../sql/schema.sql");

/// Create the ledger tables, types and triggers if they are missing.
pub async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PostgresUnit {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnit {
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn lock_account(&mut self, account_id: AccountId) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT id FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_account", e))?;

        match row {
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownAccount(account_id.to_string())),
        }
    }

    async fn entry_totals(&mut self, account_id: AccountId) -> Result<EntryTotals, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT direction::text AS direction, COALESCE(SUM(amount), 0) AS total
            FROM entries
            WHERE account_id = $1
            GROUP BY direction
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("entry_totals", e))?;

        fold_totals(&rows)
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (id, description, idempotency_key, posted_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(transaction.id.as_uuid())
        .bind(&transaction.description)
        .bind(transaction.idempotency_key.as_deref())
        .bind(transaction.posted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transaction", e))?;
        Ok(())
    }

    async fn insert_entry(&mut self, entry: &Entry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO entries (id, transaction_id, account_id, direction, amount)
            VALUES ($1, $2, $3, $4::entry_direction, $5)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.transaction_id.as_uuid())
        .bind(entry.account_id.as_uuid())
        .bind(entry.direction.as_str())
        .bind(entry.amount.amount())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_entry", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), err)]
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        Ok(Box::new(PostgresUnit { tx }))
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn entry_totals(&self, account_id: AccountId) -> Result<EntryTotals, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT direction::text AS direction, COALESCE(SUM(amount), 0) AS total
            FROM entries
            WHERE account_id = $1
            GROUP BY direction
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entry_totals", e))?;

        fold_totals(&rows)
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, description, idempotency_key, posted_at
            FROM transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_transaction_by_idempotency_key", e))?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT id, name, ledger FROM accounts WHERE id = $1")
            .bind(account_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_account", e))?;

        row.map(|row| -> Result<Account, sqlx::Error> {
            Ok(Account {
                id: AccountId::from_uuid(row.try_get("id")?),
                name: row.try_get("name")?,
                ledger: row.try_get("ledger")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("get_account", e))
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO accounts (id, name, ledger) VALUES ($1, $2, $3)")
            .bind(account.id.as_uuid())
            .bind(&account.name)
            .bind(&account.ledger)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_account", e))?;
        Ok(())
    }

    async fn transaction_entries(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, account_id, direction::text AS direction, amount
            FROM entries
            WHERE transaction_id = $1
            ORDER BY direction DESC, id ASC
            "#,
        )
        .bind(transaction_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transaction_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn ledger_totals(&self) -> Result<EntryTotals, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT direction::text AS direction, COALESCE(SUM(amount), 0) AS total
            FROM entries
            GROUP BY direction
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_totals", e))?;

        fold_totals(&rows)
    }
}

fn parse_direction(raw: &str) -> Result<Direction, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown entry direction '{raw}'")))
}

fn fold_totals(rows: &[PgRow]) -> Result<EntryTotals, StoreError> {
    let mut totals = EntryTotals::default();
    for row in rows {
        let direction: String = row
            .try_get("direction")
            .map_err(|e| map_sqlx_error("entry_totals", e))?;
        let total: Decimal = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("entry_totals", e))?;
        totals.record(parse_direction(&direction)?, Money::new(total))?;
    }
    Ok(totals)
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let decode = |e| map_sqlx_error("decode transaction", e);
    let posted_at: DateTime<Utc> = row.try_get("posted_at").map_err(decode)?;
    Ok(Transaction {
        id: TransactionId::from_uuid(row.try_get("id").map_err(decode)?),
        description: row.try_get("description").map_err(decode)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode)?,
        posted_at,
    })
}

fn entry_from_row(row: &PgRow) -> Result<Entry, StoreError> {
    let decode = |e| map_sqlx_error("decode entry", e);
    let direction: String = row.try_get("direction").map_err(decode)?;
    let amount: Decimal = row.try_get("amount").map_err(decode)?;
    Ok(Entry {
        id: EntryId::from_uuid(row.try_get("id").map_err(decode)?),
        transaction_id: TransactionId::from_uuid(row.try_get("transaction_id").map_err(decode)?),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(decode)?),
        direction: parse_direction(&direction)?,
        amount: Money::new(amount),
    })
}

/// Map a SQLx error to a `StoreError`. See the module docs for the table.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("23505") => StoreError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                },
                Some("23503") => StoreError::UnknownAccount(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("{} in {}", err, operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
