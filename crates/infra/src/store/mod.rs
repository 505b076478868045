//! Ledger store boundary.
//!
//! Defines the transactional persistence abstraction the transfer engine runs
//! against, plus the in-memory (tests/dev) and Postgres adapters.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::{PostgresLedgerStore, apply_schema};
pub use r#trait::{IDEMPOTENCY_KEY_CONSTRAINT, LedgerStore, StoreError, UnitOfWork};
