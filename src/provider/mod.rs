//! Provider gateway
//!
//! The boundary to external money movers: payment processors confirming
//! top-ups, fulfilment providers delivering airtime, data and bill
//! payments. Every provider answer is normalized into exactly three
//! outcomes. Transport errors and timeouts never count as failure; the
//! provider may have done the work, so the engine treats them as
//! indeterminate and lets reconciliation find the truth.

pub mod mock;

pub use mock::{MockProvider, Script};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Amount, TransactionKind};

/// What the engine asks a provider to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub transaction_id: Uuid,
    pub reference: String,
    pub kind: TransactionKind,
    pub amount: Amount,

    /// Service payload: phone number, plan code, meter number, ...
    pub details: serde_json::Value,
}

/// Definitive classification of a provider answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOutcome {
    /// The provider did the work.
    Success,

    /// The provider definitively did not and will not do the work.
    Failure,

    /// No definitive answer. Only a later requery may resolve it.
    Indeterminate,
}

/// Normalized provider answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    pub outcome: ProviderOutcome,

    /// Reference the provider assigned, when one was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_reference: Option<String>,

    /// Human-oriented status line.
    pub message: String,

    /// Amount the provider reports having processed, in kobo. Settlement
    /// trusts this figure over anything the caller claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_amount: Option<Amount>,

    /// Raw provider payload, kept verbatim for the receipt.
    pub payload: serde_json::Value,
}

impl ProviderResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self::with_outcome(ProviderOutcome::Success, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::with_outcome(ProviderOutcome::Failure, message)
    }

    pub fn indeterminate(message: impl Into<String>) -> Self {
        Self::with_outcome(ProviderOutcome::Indeterminate, message)
    }

    fn with_outcome(outcome: ProviderOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            provider_reference: None,
            message: message.into(),
            verified_amount: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_provider_reference(mut self, reference: impl Into<String>) -> Self {
        self.provider_reference = Some(reference.into());
        self
    }

    pub fn with_verified_amount(mut self, amount: Amount) -> Self {
        self.verified_amount = Some(amount);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Errors below the outcome level: the call itself did not complete.
/// Callers must treat these as indeterminate, never as failure.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Provider call timed out")]
    Timeout,

    #[error("Provider returned an unreadable response: {0}")]
    Protocol(String),
}

/// One external provider, behind a normalized contract.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Carry out the work for a spend. Called at most once per reference
    /// by the engine; retries go through `requery`.
    async fn execute(&self, request: &ProviderRequest) -> Result<ProviderResult, ProviderError>;

    /// Ask what happened to a reference submitted earlier. Safe to call
    /// any number of times.
    async fn requery(&self, reference: &str) -> Result<ProviderResult, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&ProviderOutcome::Indeterminate).unwrap();
        assert_eq!(json, r#""indeterminate""#);

        let parsed: ProviderOutcome = serde_json::from_str(r#""success""#).unwrap();
        assert_eq!(parsed, ProviderOutcome::Success);
    }

    #[test]
    fn test_result_builders() {
        let amount = Amount::from_kobo(50_000).unwrap();
        let result = ProviderResult::success("delivered")
            .with_provider_reference("PROV-1")
            .with_verified_amount(amount)
            .with_payload(serde_json::json!({"status": "delivered"}));

        assert_eq!(result.outcome, ProviderOutcome::Success);
        assert_eq!(result.provider_reference.as_deref(), Some("PROV-1"));
        assert_eq!(result.verified_amount, Some(amount));
        assert_eq!(result.payload["status"], "delivered");

        let result = ProviderResult::indeterminate("socket closed mid-flight");
        assert_eq!(result.outcome, ProviderOutcome::Indeterminate);
        assert!(result.provider_reference.is_none());
    }
}
