//! Engine commands and results
//!
//! Commands are the write surface of the engine. Each carries the caller's
//! reference so a retried command is recognizable, and an operation context
//! recording who asked.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{OperationContext, Transaction, TransactionKind};

/// Command to spend wallet funds through a fulfilment provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendCommand {
    /// Account to debit
    pub account_id: Uuid,

    /// What is being bought (airtime, data, bill)
    pub kind: TransactionKind,

    /// Amount in kobo
    pub amount_kobo: i64,

    /// Caller-supplied idempotent reference
    pub reference: String,

    /// Provider payload (phone number, plan code, meter number)
    pub details: serde_json::Value,

    /// Who initiated this operation
    pub context: OperationContext,
}

impl SpendCommand {
    pub fn new(
        account_id: Uuid,
        kind: TransactionKind,
        amount_kobo: i64,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            kind,
            amount_kobo,
            reference: reference.into(),
            details: serde_json::Value::Null,
            context: OperationContext::new(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }
}

/// Command to start funding a wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopUpCommand {
    /// Account to credit once the payment is verified
    pub account_id: Uuid,

    /// Amount the caller claims was (or will be) paid, in kobo
    pub amount_kobo: i64,

    /// Caller-supplied reference; generated when absent
    pub reference: Option<String>,

    /// Payment channel payload
    pub details: serde_json::Value,

    /// Who initiated this operation
    pub context: OperationContext,
}

impl TopUpCommand {
    pub fn new(account_id: Uuid, amount_kobo: i64) -> Self {
        Self {
            account_id,
            amount_kobo,
            reference: None,
            details: serde_json::Value::Null,
            context: OperationContext::new(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }
}

/// Command to verify a pending top-up with the provider and credit the wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmTopUpCommand {
    /// Reference of the pending top-up
    pub reference: String,

    /// Who initiated this operation
    pub context: OperationContext,
}

impl ConfirmTopUpCommand {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            context: OperationContext::new(),
        }
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }
}

/// Command to mark a pending top-up as failed without moving money
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailTopUpCommand {
    /// Reference of the pending top-up
    pub reference: String,

    /// Why the payment failed, straight into the receipt
    pub reason: String,

    /// Who initiated this operation
    pub context: OperationContext,
}

impl FailTopUpCommand {
    pub fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
            context: OperationContext::operator(),
        }
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }
}

/// Outcome of an engine command.
///
/// `replayed` is true when the command hit an already-recorded reference and
/// the stored transaction came back instead of a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub transaction: Transaction,
    pub replayed: bool,
}

impl CommandReceipt {
    pub fn fresh(transaction: Transaction) -> Self {
        Self {
            transaction,
            replayed: false,
        }
    }

    pub fn replay(transaction: Transaction) -> Self {
        Self {
            transaction,
            replayed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Initiator;

    #[test]
    fn test_spend_command_builder() {
        let account_id = Uuid::new_v4();
        let cmd = SpendCommand::new(account_id, TransactionKind::Airtime, 50_000, "TX_1")
            .with_details(serde_json::json!({"phone": "08031234567"}))
            .with_context(OperationContext::new().with_note("mobile app"));

        assert_eq!(cmd.account_id, account_id);
        assert_eq!(cmd.kind, TransactionKind::Airtime);
        assert_eq!(cmd.amount_kobo, 50_000);
        assert_eq!(cmd.reference, "TX_1");
        assert_eq!(cmd.details["phone"], "08031234567");
        assert_eq!(cmd.context.initiator, Initiator::AccountHolder);
    }

    #[test]
    fn test_topup_command_defaults() {
        let cmd = TopUpCommand::new(Uuid::new_v4(), 100_000);
        assert!(cmd.reference.is_none());
        assert!(cmd.details.is_null());

        let cmd = cmd.with_reference("FUND_custom");
        assert_eq!(cmd.reference.as_deref(), Some("FUND_custom"));
    }

    #[test]
    fn test_fail_topup_defaults_to_operator() {
        let cmd = FailTopUpCommand::new("FUND_1", "card declined");
        assert_eq!(cmd.context.initiator, Initiator::Operator);
    }
}
