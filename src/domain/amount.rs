//! Monetary amounts in integer kobo
//!
//! Domain primitives for money. Every value is an integer count of minor
//! units (kobo), validated at construction time so invalid values cannot
//! exist in the system. Decimal is used only to parse operator-facing
//! major-unit strings; ledger arithmetic never touches floats.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// Kobo per naira.
pub const KOBO_PER_NAIRA: i64 = 100;

/// Maximum allowed value (ten trillion naira, in kobo).
const MAX_KOBO: i64 = 1_000_000_000_000_000;

/// Amount represents a validated mutation size.
///
/// # Invariants
/// - Value is always positive (> 0)
/// - Value never exceeds `MAX_KOBO`
///
/// # Example
/// ```
/// use kobo_ledger::domain::Amount;
///
/// let amount = Amount::from_kobo(50_000).unwrap();
/// assert_eq!(amount.kobo(), 50_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

/// Errors that can occur when creating an Amount or Balance
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount must be positive (got {0} kobo)")]
    NotPositive(i64),

    #[error("Balance cannot be negative (got {0} kobo)")]
    Negative(i64),

    #[error("Amount has sub-kobo precision (max 2 decimal places, got {0})")]
    TooManyDecimals(u32),

    #[error("Amount exceeds maximum allowed value ({MAX_KOBO} kobo)")]
    Overflow,

    #[error("Invalid amount format: {0}")]
    ParseError(String),
}

impl Amount {
    /// Create a new Amount from a kobo count with validation.
    ///
    /// # Errors
    /// - `AmountError::NotPositive` if value <= 0
    /// - `AmountError::Overflow` if value > `MAX_KOBO`
    pub fn from_kobo(value: i64) -> Result<Self, AmountError> {
        // Rule 1: Must be positive
        if value <= 0 {
            return Err(AmountError::NotPositive(value));
        }

        // Rule 2: Bounded
        if value > MAX_KOBO {
            return Err(AmountError::Overflow);
        }

        Ok(Self(value))
    }

    /// Create an Amount from whole naira.
    pub fn from_naira(value: i64) -> Result<Self, AmountError> {
        let kobo = value
            .checked_mul(KOBO_PER_NAIRA)
            .ok_or(AmountError::Overflow)?;
        Self::from_kobo(kobo)
    }

    /// Get the kobo count.
    pub fn kobo(&self) -> i64 {
        self.0
    }

    /// Add two amounts, rejecting the result if it leaves the valid range.
    pub fn try_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        let sum = self.0.checked_add(other.0).ok_or(AmountError::Overflow)?;
        Amount::from_kobo(sum)
    }

    /// Check if this amount is greater than or equal to another.
    pub fn is_sufficient_for(&self, other: &Amount) -> bool {
        self.0 >= other.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / KOBO_PER_NAIRA, self.0 % KOBO_PER_NAIRA)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    /// Parse a major-unit string ("2500" or "2500.50") into kobo exactly.
    /// Sub-kobo precision is rejected rather than rounded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decimal =
            Decimal::from_str(s.trim()).map_err(|e| AmountError::ParseError(e.to_string()))?;

        if decimal.scale() > 2 {
            return Err(AmountError::TooManyDecimals(decimal.scale()));
        }

        let kobo = (decimal * Decimal::from(KOBO_PER_NAIRA))
            .to_i64()
            .ok_or(AmountError::Overflow)?;
        Amount::from_kobo(kobo)
    }
}

impl TryFrom<i64> for Amount {
    type Error = AmountError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Amount::from_kobo(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl Add for Amount {
    type Output = Result<Amount, AmountError>;

    fn add(self, rhs: Self) -> Self::Output {
        self.try_add(&rhs)
    }
}

// Note: no Sub impl. The difference of two Amounts might be <= 0, which is
// not an Amount; subtraction happens on Balance with explicit validation.

/// Balance represents an account balance in kobo (zero or positive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Balance(i64);

impl Balance {
    /// Create a new balance (zero or positive).
    pub fn new(value: i64) -> Result<Self, AmountError> {
        if value < 0 {
            return Err(AmountError::Negative(value));
        }

        if value > MAX_KOBO {
            return Err(AmountError::Overflow);
        }

        Ok(Self(value))
    }

    /// Create a zero balance.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Get the kobo count.
    pub fn kobo(&self) -> i64 {
        self.0
    }

    /// Check if balance covers a debit of `amount`.
    pub fn is_sufficient_for(&self, amount: &Amount) -> bool {
        self.0 >= amount.kobo()
    }

    /// Add amount to balance.
    pub fn credit(&self, amount: &Amount) -> Result<Balance, AmountError> {
        let new_value = self
            .0
            .checked_add(amount.kobo())
            .ok_or(AmountError::Overflow)?;
        Balance::new(new_value)
    }

    /// Subtract amount from balance. Fails with `AmountError::Negative`
    /// if the balance does not cover the amount.
    pub fn debit(&self, amount: &Amount) -> Result<Balance, AmountError> {
        let new_value = self
            .0
            .checked_sub(amount.kobo())
            .ok_or(AmountError::Overflow)?;
        Balance::new(new_value)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / KOBO_PER_NAIRA, self.0 % KOBO_PER_NAIRA)
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_positive() {
        let amount = Amount::from_kobo(100);
        assert!(amount.is_ok());
        assert_eq!(amount.unwrap().kobo(), 100);
    }

    #[test]
    fn test_amount_zero_rejected() {
        let amount = Amount::from_kobo(0);
        assert!(matches!(amount, Err(AmountError::NotPositive(0))));
    }

    #[test]
    fn test_amount_negative_rejected() {
        let amount = Amount::from_kobo(-100);
        assert!(matches!(amount, Err(AmountError::NotPositive(-100))));
    }

    #[test]
    fn test_amount_overflow() {
        let amount = Amount::from_kobo(MAX_KOBO + 1);
        assert!(matches!(amount, Err(AmountError::Overflow)));
    }

    #[test]
    fn test_amount_max_value_ok() {
        let amount = Amount::from_kobo(MAX_KOBO);
        assert!(amount.is_ok());
    }

    #[test]
    fn test_amount_from_naira() {
        let amount = Amount::from_naira(500).unwrap();
        assert_eq!(amount.kobo(), 50_000);
    }

    #[test]
    fn test_amount_from_str_exact_kobo() {
        let amount: Amount = "499.99".parse().unwrap();
        assert_eq!(amount.kobo(), 49_999);

        let amount: Amount = "2500".parse().unwrap();
        assert_eq!(amount.kobo(), 250_000);

        let amount: Amount = "0.01".parse().unwrap();
        assert_eq!(amount.kobo(), 1);
    }

    #[test]
    fn test_amount_from_str_sub_kobo_rejected() {
        let amount: Result<Amount, _> = "10.005".parse();
        assert!(matches!(amount, Err(AmountError::TooManyDecimals(3))));
    }

    #[test]
    fn test_amount_from_str_garbage_rejected() {
        let amount: Result<Amount, _> = "ten naira".parse();
        assert!(matches!(amount, Err(AmountError::ParseError(_))));
    }

    #[test]
    fn test_amount_try_add() {
        let a = Amount::from_kobo(100).unwrap();
        let b = Amount::from_kobo(50).unwrap();
        let sum = a.try_add(&b).unwrap();
        assert_eq!(sum.kobo(), 150);
    }

    #[test]
    fn test_amount_try_add_overflow() {
        let a = Amount::from_kobo(MAX_KOBO).unwrap();
        let b = Amount::from_kobo(1).unwrap();
        assert!(matches!(a.try_add(&b), Err(AmountError::Overflow)));
    }

    #[test]
    fn test_amount_display_major_units() {
        let amount = Amount::from_kobo(12_345).unwrap();
        assert_eq!(amount.to_string(), "123.45");

        let amount = Amount::from_kobo(5).unwrap();
        assert_eq!(amount.to_string(), "0.05");
    }

    #[test]
    fn test_balance_credit_debit() {
        let balance = Balance::zero();
        let amount = Amount::from_kobo(100).unwrap();

        // Credit
        let balance = balance.credit(&amount).unwrap();
        assert_eq!(balance.kobo(), 100);

        // Debit
        let withdraw = Amount::from_kobo(30).unwrap();
        let balance = balance.debit(&withdraw).unwrap();
        assert_eq!(balance.kobo(), 70);
    }

    #[test]
    fn test_balance_insufficient() {
        let balance = Balance::new(50).unwrap();
        let amount = Amount::from_kobo(100).unwrap();

        assert!(!balance.is_sufficient_for(&amount));

        let result = balance.debit(&amount);
        assert!(matches!(result, Err(AmountError::Negative(-50))));
    }

    #[test]
    fn test_balance_never_negative() {
        assert!(matches!(Balance::new(-1), Err(AmountError::Negative(-1))));
    }
}
