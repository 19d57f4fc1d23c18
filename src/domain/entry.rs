//! Ledger entries
//!
//! The append-only record of balance mutations. Entries are immutable once
//! written; corrections are new compensating entries, never edits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::amount::{Amount, Balance};

/// Which side of the ledger an entry sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryDirection {
    /// Balance decreased.
    Debit,

    /// Balance increased.
    Credit,
}

impl EntryDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryDirection::Debit => "DEBIT",
            EntryDirection::Credit => "CREDIT",
        }
    }
}

impl std::fmt::Display for EntryDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(EntryDirection::Debit),
            "CREDIT" => Ok(EntryDirection::Credit),
            other => Err(format!("Unknown entry direction: {other}")),
        }
    }
}

/// One committed balance mutation.
///
/// `seq` is the entry's position in its account's ledger and equals the
/// account version produced by the commit. It is strictly increasing per
/// account with no gaps, which makes it the cursor for history pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub transaction_id: Uuid,
    pub seq: i64,
    pub direction: EntryDirection,
    pub amount: Amount,
    pub balance_after: Balance,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        account_id: Uuid,
        transaction_id: Uuid,
        seq: i64,
        direction: EntryDirection,
        amount: Amount,
        balance_after: Balance,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            transaction_id,
            seq,
            direction,
            amount,
            balance_after,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// Signed kobo effect on the balance: credits positive, debits negative.
    pub fn signed_kobo(&self) -> i64 {
        match self.direction {
            EntryDirection::Credit => self.amount.kobo(),
            EntryDirection::Debit => -self.amount.kobo(),
        }
    }
}
