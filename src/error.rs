//! Error handling module
//!
//! The crate-wide error taxonomy. Domain and store errors are wrapped here;
//! callers branch on variants, logs carry the stable error codes.

use uuid::Uuid;

use crate::domain::{AmountError, TransitionError};
use crate::store::StoreError;

/// Crate-wide Result type
pub type WalletResult<T> = Result<T, WalletError>;

/// Wallet error types
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    // Caller errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("Insufficient funds in account {account_id}: required {required} kobo, available {available} kobo")]
    InsufficientFunds {
        account_id: Uuid,
        required: i64,
        available: i64,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Account is disabled: {0}")]
    AccountDisabled(Uuid),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("No transaction recorded for reference {0}")]
    ReferenceNotFound(String),

    #[error("Reference {0} is still being processed")]
    ReferenceInFlight(String),

    #[error("Reference {0} was already used with different parameters")]
    ReferenceReuse(String),

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    // Provider outcomes
    #[error("Provider rejected {reference}: {message}")]
    ProviderFailure { reference: String, message: String },

    #[error("Provider outcome for {0} is unknown, queued for reconciliation")]
    ProviderIndeterminate(String),

    // Infrastructure
    #[error("Account {0} is under write contention, retry later")]
    Contention(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Stable code for logs and structured output.
    pub fn error_code(&self) -> &'static str {
        match self {
            WalletError::InvalidRequest(_) => "invalid_request",
            WalletError::InvalidAmount(_) => "invalid_amount",
            WalletError::InsufficientFunds { .. } => "insufficient_funds",
            WalletError::AccountNotFound(_) => "account_not_found",
            WalletError::AccountDisabled(_) => "account_disabled",
            WalletError::TransactionNotFound(_) => "transaction_not_found",
            WalletError::ReferenceNotFound(_) => "reference_not_found",
            WalletError::ReferenceInFlight(_) => "reference_in_flight",
            WalletError::ReferenceReuse(_) => "reference_reuse",
            WalletError::IllegalTransition(_) => "illegal_transition",
            WalletError::ProviderFailure { .. } => "provider_failure",
            WalletError::ProviderIndeterminate(_) => "provider_indeterminate",
            WalletError::Contention(_) => "contention",
            WalletError::Store(_) => "store_error",
            WalletError::Internal(_) => "internal_error",
        }
    }

    /// Check if this is a client error (the request itself is wrong)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WalletError::InvalidRequest(_)
                | WalletError::InvalidAmount(_)
                | WalletError::InsufficientFunds { .. }
                | WalletError::AccountNotFound(_)
                | WalletError::AccountDisabled(_)
                | WalletError::TransactionNotFound(_)
                | WalletError::ReferenceNotFound(_)
                | WalletError::ReferenceReuse(_)
                | WalletError::IllegalTransition(_)
        )
    }

    /// Check if retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            WalletError::Contention(_) | WalletError::ReferenceInFlight(_) => true,
            WalletError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
