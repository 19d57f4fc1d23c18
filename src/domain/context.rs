//! Operation Context
//!
//! Provenance metadata carried on every transaction for audit and tracing.
//! Reversals forced by reconciliation stay distinguishable from ones the
//! account holder triggered.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who asked for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    /// The wallet's owner, through the normal API path.
    AccountHolder,

    /// A human operator acting on the account.
    Operator,

    /// The reconciliation job resolving an indeterminate outcome.
    Reconciler,
}

/// Context for an operation, used for auditing and tracing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub initiator: Initiator,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Free-form operator note (reason for a forced action)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl OperationContext {
    /// Create a context for an account-holder operation.
    pub fn new() -> Self {
        Self {
            initiator: Initiator::AccountHolder,
            correlation_id: None,
            note: None,
        }
    }

    /// Create a context for an operator action.
    pub fn operator() -> Self {
        Self {
            initiator: Initiator::Operator,
            correlation_id: None,
            note: None,
        }
    }

    /// Create a context for the reconciliation job.
    pub fn reconciler() -> Self {
        Self {
            initiator: Initiator::Reconciler,
            correlation_id: None,
            note: None,
        }
    }

    /// Attach a correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let correlation_id = Uuid::new_v4();

        let context = OperationContext::reconciler()
            .with_correlation_id(correlation_id)
            .with_note("requery window expired");

        assert_eq!(context.initiator, Initiator::Reconciler);
        assert_eq!(context.correlation_id, Some(correlation_id));
        assert_eq!(context.note.as_deref(), Some("requery window expired"));
    }

    #[test]
    fn test_ensure_correlation_id() {
        let mut context = OperationContext::new();
        assert!(context.correlation_id.is_none());

        let id = context.ensure_correlation_id();
        assert!(context.correlation_id.is_some());
        assert_eq!(context.correlation_id.unwrap(), id);

        // Calling again should return the same ID
        let id2 = context.ensure_correlation_id();
        assert_eq!(id, id2);
    }
}
