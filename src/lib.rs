//! kobo-ledger Library
//!
//! Wallet ledger and balance-mutation engine: an append-only entry stream
//! per account, a balance projection guarded by optimistic concurrency,
//! reference idempotency, and provider-settled transaction orchestration.

pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod jobs;
pub mod ledger;
pub mod provider;
pub mod store;

pub use config::WalletConfig;
pub use error::{WalletError, WalletResult};

pub use domain::{Account, AccountStatus, Amount, AmountError, Balance, OperationContext};
pub use domain::{Transaction, TransactionKind, TransactionStatus};
pub use engine::{CommandReceipt, SpendCommand, TopUpCommand, TransactionEngine};
pub use idempotency::IdempotencyGuard;
pub use ledger::Ledger;
pub use provider::ProviderGateway;
pub use store::WalletStore;
