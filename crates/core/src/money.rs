//! Exact decimal money.
//!
//! All amounts in the ledger are `rust_decimal::Decimal` values wrapped in
//! [`Money`]. Binary floating point never touches an amount: values enter as
//! decimal strings, are rounded to the ledger scale with banker's rounding and
//! leave formatted at that scale.

use core::fmt;
use core::ops::{Add, Neg, Sub};
use core::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// An exact decimal amount (currency-agnostic; the ledger carries the tag).
///
/// Serializes as a decimal string (`"40.00"`) so JSON clients never see a float.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    /// Build from an integer count of minor units (`4000` at scale 2 is `40.00`).
    pub fn from_minor(minor: i64, scale: u32) -> Self {
        Self(Decimal::new(minor, scale))
    }

    /// Parse a plain decimal string such as `"10.50"` or `"-3"`.
    ///
    /// Scientific notation is rejected; it has no place in a money field.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("amount is empty"));
        }
        if trimmed.contains(['e', 'E']) {
            return Err(DomainError::validation(format!(
                "amount must be a plain decimal: {trimmed}"
            )));
        }
        Decimal::from_str(trimmed)
            .map(Self)
            .map_err(|e| DomainError::validation(format!("invalid amount '{trimmed}': {e}")))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    /// Strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Round to exactly `scale` fractional digits, ties to even (`40` -> `40.00`).
    pub fn round_to_scale(&self, scale: u32) -> Self {
        let mut rounded = self
            .0
            .round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven);
        rounded.rescale(scale);
        Self(rounded)
    }

    /// Render with exactly `scale` fractional digits (`60` -> `"60.00"`).
    pub fn to_scaled_string(&self, scale: u32) -> String {
        self.round_to_scale(scale).0.to_string()
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::overflow(format!("{self} + {other}")))
    }

    pub fn checked_sub(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::overflow(format!("{self} - {other}")))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Money {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl core::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

/// Currency tag + fractional scale of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerCurrency {
    code: String,
    scale: u32,
}

impl LedgerCurrency {
    pub fn new(code: impl Into<String>, scale: u32) -> Self {
        Self {
            code: code.into().to_uppercase(),
            scale,
        }
    }

    pub fn usd() -> Self {
        Self::new("USD", 2)
    }

    /// Look up the conventional scale for an ISO code (zero-decimal currencies
    /// like JPY use 0, everything else 2).
    pub fn from_code(code: &str) -> DomainResult<Self> {
        let code = code.trim().to_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "currency code must be three letters: '{code}'"
            )));
        }
        let scale = match code.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
            _ => 2,
        };
        Ok(Self { code, scale })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Format an amount at this ledger's scale.
    pub fn format(&self, money: Money) -> String {
        money.to_scaled_string(self.scale)
    }
}

impl Default for LedgerCurrency {
    fn default() -> Self {
        Self::usd()
    }
}

impl fmt::Display for LedgerCurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}
