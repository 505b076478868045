//! Accounting module (double-entry ledger model).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod ledger;

pub use ledger::{
    Account, Direction, Entry, EntryTotals, Posting, Transaction, TransferRequest,
};
