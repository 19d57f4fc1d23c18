//! Transactions
//!
//! The unit of work the engine drives from intent to a terminal state.
//! A transaction owns exactly one external reference and carries the
//! provider receipt once settlement is known.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::amount::Amount;
use super::context::OperationContext;

/// What the money movement is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Inbound top-up of the wallet.
    WalletFund,

    /// Airtime purchase.
    Airtime,

    /// Mobile data purchase.
    Data,

    /// Bill payment (electricity, TV, ...).
    Bill,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::WalletFund => "WALLET_FUND",
            TransactionKind::Airtime => "AIRTIME",
            TransactionKind::Data => "DATA",
            TransactionKind::Bill => "BILL",
        }
    }

    /// Spends debit the wallet and call out to a fulfilment provider.
    pub fn is_spend(&self) -> bool {
        !self.is_topup()
    }

    /// Top-ups credit the wallet once the payment provider confirms.
    pub fn is_topup(&self) -> bool {
        matches!(self, TransactionKind::WalletFund)
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WALLET_FUND" => Ok(TransactionKind::WalletFund),
            "AIRTIME" => Ok(TransactionKind::Airtime),
            "DATA" => Ok(TransactionKind::Data),
            "BILL" => Ok(TransactionKind::Bill),
            other => Err(format!("Unknown transaction kind: {other}")),
        }
    }
}

/// Transaction lifecycle.
///
/// ```text
/// Pending ---> Reserved ---> Settled
///    |             |
///    |             +-------> Reversed
///    +---> Settled
///    +---> Reversed
/// ```
///
/// `Settled` and `Reversed` are terminal; every departure from them is
/// refused. For spends the reserved debit is already on the ledger, so
/// Reserved -> Reversed carries a compensating credit. For top-ups nothing
/// is credited before `Settled`, so all transitions are ledger-neutral
/// until the confirming credit itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Intent recorded, no balance effect yet.
    Pending,

    /// Funds held on the ledger, provider outcome unknown.
    Reserved,

    /// Final: the transaction happened.
    Settled,

    /// Final: the transaction did not happen; any held funds were returned.
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Reserved => "RESERVED",
            TransactionStatus::Settled => "SETTLED",
            TransactionStatus::Reversed => "REVERSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Settled | TransactionStatus::Reversed)
    }

    /// The legal departures from this status.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Reserved) | (Pending, Settled) | (Pending, Reversed)
                | (Reserved, Settled)
                | (Reserved, Reversed)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "RESERVED" => Ok(TransactionStatus::Reserved),
            "SETTLED" => Ok(TransactionStatus::Settled),
            "REVERSED" => Ok(TransactionStatus::Reversed),
            other => Err(format!("Unknown transaction status: {other}")),
        }
    }
}

/// Refused status transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

/// A wallet transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: TransactionKind,

    /// Caller-supplied (or generated) external reference. Unique across the
    /// store; the idempotency guard keys on it.
    pub reference: String,

    pub amount: Amount,
    pub status: TransactionStatus,

    /// Service-specific request details (phone number, plan code, meter
    /// number, ...). Opaque to the ledger.
    pub details: serde_json::Value,

    /// Reference assigned by the provider, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_reference: Option<String>,

    /// Raw provider payload captured at settlement, for audit and replay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<serde_json::Value>,

    pub context: OperationContext,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the transaction enters a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Record a new intent. Every transaction starts `Pending`.
    pub fn new(
        account_id: Uuid,
        kind: TransactionKind,
        reference: impl Into<String>,
        amount: Amount,
        details: serde_json::Value,
        context: OperationContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            reference: reference.into(),
            amount,
            status: TransactionStatus::Pending,
            details,
            provider_reference: None,
            receipt: None,
            context,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    /// Move to `next`, refusing departures the lifecycle does not allow.
    pub fn transition(&mut self, next: TransactionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finalized_at = Some(now);
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The amount the caller originally asked for.
    ///
    /// Settlement may replace `amount` with the provider-verified figure;
    /// when that happens the requested figure survives on the receipt.
    pub fn requested_amount(&self) -> Amount {
        self.receipt
            .as_ref()
            .and_then(|receipt| receipt.get("requested_kobo"))
            .and_then(serde_json::Value::as_i64)
            .and_then(|kobo| Amount::from_kobo(kobo).ok())
            .unwrap_or(self.amount)
    }
}

/// Generate an external reference: `PREFIX_<32 hex chars>`.
pub fn generate_reference(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}
