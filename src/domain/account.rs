//! Account
//!
//! The balance projection for a single wallet. The balance field is derived
//! state: it always equals the running sum of the account's ledger entries
//! and is maintained under the same atomic commit that appends each entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::amount::Balance;

/// Account lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Accepts new transactions.
    Active,

    /// Soft-disabled: refuses new intents. In-flight transactions still
    /// reach their terminal state, including compensating credits.
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "disabled" => Ok(AccountStatus::Disabled),
            other => Err(format!("Unknown account status: {other}")),
        }
    }
}

/// A wallet account.
///
/// `version` counts committed balance mutations and doubles as the
/// optimistic-concurrency token: every commit carries the version the writer
/// read, and the store rejects the write when another commit got there first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub holder: String,
    pub status: AccountStatus,
    pub balance: Balance,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Open a new active account with a zero balance.
    pub fn open(holder: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            holder: holder.into(),
            status: AccountStatus::Active,
            balance: Balance::zero(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the account accepts new intents.
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}
