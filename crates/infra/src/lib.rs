//! Infrastructure layer: ledger store adapters, balance calculator, transfer
//! engine and the background transfer queue.

pub mod balance;
pub mod engine;
pub mod jobs;
pub mod store;


pub use balance::{AccountBalance, BalanceCalculator};
pub use engine::{EngineConfig, TransferEngine, TransferError, TransferReceipt};
