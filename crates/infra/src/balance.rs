//! Balance Calculator.
//!
//! A balance is never stored: it is `sum(CREDIT) - sum(DEBIT)` over an
//! account's entries, evaluated at whatever isolation the caller is reading at.

use serde::Serialize;
use tracing::instrument;

use ledgerline_core::{AccountId, LedgerCurrency, Money};

use crate::store::{LedgerStore, StoreError, UnitOfWork};

pub struct BalanceCalculator;

impl BalanceCalculator {
    /// Standalone read, outside any unit of work.
    #[instrument(skip(store), fields(account_id = %account_id), err)]
    pub async fn balance<S>(store: &S, account_id: AccountId) -> Result<Money, StoreError>
    where
        S: LedgerStore + ?Sized,
    {
        Ok(store.entry_totals(account_id).await?.balance())
    }

    /// Read inside `unit`, at the unit's isolation (sees its own writes).
    pub async fn balance_in(
        unit: &mut dyn UnitOfWork,
        account_id: AccountId,
    ) -> Result<Money, StoreError> {
        Ok(unit.entry_totals(account_id).await?.balance())
    }
}

/// User-facing balance view, formatted at the ledger scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub balance: String,
    pub currency: String,
}

impl AccountBalance {
    pub fn new(account_id: AccountId, balance: Money, currency: &LedgerCurrency) -> Self {
        Self {
            account_id,
            balance: currency.format(balance),
            currency: currency.code().to_string(),
        }
    }

    /// Read and format the balance of `account_id`. Accounts without entries
    /// (including unknown ones) report zero.
    pub async fn load<S>(
        store: &S,
        account_id: AccountId,
        currency: &LedgerCurrency,
    ) -> Result<Self, StoreError>
    where
        S: LedgerStore + ?Sized,
    {
        let balance = BalanceCalculator::balance(store, account_id).await?;
        Ok(Self::new(account_id, balance, currency))
    }
}
