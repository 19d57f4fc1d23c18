//! Domain module
//!
//! Core domain types and business rules.

pub mod account;
pub mod amount;
pub mod context;
pub mod entry;
pub mod transaction;

pub use account::{Account, AccountStatus};
pub use amount::{Amount, AmountError, Balance};
pub use context::{Initiator, OperationContext};
pub use entry::{EntryDirection, LedgerEntry};
pub use transaction::{
    generate_reference, Transaction, TransactionKind, TransactionStatus, TransitionError,
};
