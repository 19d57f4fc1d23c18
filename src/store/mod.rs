//! Wallet store
//!
//! Persistence seam for the ledger. A store exposes one atomic write
//! primitive (`commit`) that applies exactly one ledger entry, its balance
//! effect and its transaction record against one account under an optimistic
//! version check, plus a status-only CAS for ledger-neutral transitions and
//! the raw claim rows the idempotency guard builds on. Everything above this
//! trait (ledger, engine, jobs) is store-agnostic.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Account, AccountStatus, Balance, LedgerEntry, Transaction, TransactionStatus,
};

/// Errors surfaced by a wallet store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict
    #[error("Version conflict for account {account_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        account_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// A transaction with this reference is already committed
    #[error("Reference already committed: {0}")]
    DuplicateReference(String),

    /// Transaction status changed under a guarded update
    #[error("Transaction {transaction_id} is {actual}, update expected {expected}")]
    StatusConflict {
        transaction_id: Uuid,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data failed to map back into domain types
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Check if this error is a version conflict
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Database(_)
        )
    }
}

/// How a commit touches the transaction record.
#[derive(Debug, Clone)]
pub enum TransactionWrite {
    /// First write of the transaction row. Fails with `DuplicateReference`
    /// if the reference is already committed.
    Insert(Transaction),

    /// Rewrite of an existing row, guarded by the status the writer read.
    /// Fails with `StatusConflict` if another writer finalized first.
    Update {
        expected_status: TransactionStatus,
        transaction: Transaction,
    },
}

impl TransactionWrite {
    pub fn transaction(&self) -> &Transaction {
        match self {
            TransactionWrite::Insert(tx) => tx,
            TransactionWrite::Update { transaction, .. } => transaction,
        }
    }
}

/// One balance mutation, applied atomically or not at all.
///
/// The store persists the entry, moves the account balance to
/// `new_balance`, bumps the account version to `expected_version + 1` and
/// applies the transaction write in a single atomic step. The version check
/// is the serialization point: if the account moved since the writer read
/// it, nothing is applied and `VersionConflict` comes back.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub account_id: Uuid,
    pub expected_version: i64,
    pub new_balance: Balance,
    pub entry: LedgerEntry,
    pub transaction: TransactionWrite,
}

/// A raw reference claim row. Policy (fingerprints, takeover windows)
/// lives in the idempotency guard; the store only provides atomic rows.
#[derive(Debug, Clone)]
pub struct ClaimRow {
    pub reference: String,

    /// Hex SHA-256 over the operation parameters.
    pub fingerprint: String,

    /// Ownership token. Mutating claim operations require it, so a claim
    /// taken over by another worker cannot be released by the original.
    pub token: Uuid,

    /// Set once the claimed reference has a committed transaction.
    pub transaction_id: Option<Uuid>,

    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of trying to insert a claim row.
#[derive(Debug, Clone)]
pub enum ClaimInsert {
    /// The reference was free; the row is now ours.
    Inserted,

    /// The reference is already claimed; here is the current row.
    Existing(ClaimRow),
}

/// Persistence operations every wallet store implements.
#[async_trait]
pub trait WalletStore: Send + Sync {
    // -- accounts --

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn fetch_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn set_account_status(
        &self,
        account_id: Uuid,
        status: AccountStatus,
    ) -> Result<(), StoreError>;

    // -- atomic writes --

    /// Apply one balance mutation. See [`CommitRequest`].
    async fn commit(&self, request: CommitRequest) -> Result<(), StoreError>;

    /// Insert a transaction row with no ledger effect. Top-up intents are
    /// recorded this way before any money moves. Fails with
    /// `DuplicateReference` if the reference is already taken.
    async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;

    /// Status-CAS for ledger-neutral transitions (no entry, no balance
    /// movement). Applies the full row rewrite only if the stored status
    /// still equals `expected_status`; returns whether the CAS won.
    async fn finalize_transaction(
        &self,
        expected_status: TransactionStatus,
        transaction: &Transaction,
    ) -> Result<bool, StoreError>;

    // -- transaction reads --

    async fn fetch_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError>;

    async fn fetch_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Transactions for one account, newest first. `before` is an exclusive
    /// created-at cursor.
    async fn transactions_for_account(
        &self,
        account_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Transactions sitting in `status` since before `older_than`, oldest
    /// first. Used by reconciliation to find stuck work.
    async fn transactions_in_status_since(
        &self,
        status: TransactionStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError>;

    // -- entry reads --

    /// Entries for one account, newest first. `before_seq` is an exclusive
    /// cursor over the per-account sequence.
    async fn entries_for_account(
        &self,
        account_id: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// The most recent entry for an account, if any.
    async fn head_entry(&self, account_id: Uuid) -> Result<Option<LedgerEntry>, StoreError>;

    // -- claims --

    /// Insert a claim row if the reference is free, otherwise report the
    /// existing row. Atomic with respect to concurrent inserts.
    async fn insert_claim(&self, row: ClaimRow) -> Result<ClaimInsert, StoreError>;

    async fn fetch_claim(&self, reference: &str) -> Result<Option<ClaimRow>, StoreError>;

    /// Replace an unbound claim owned by `old_token` with `row`. Returns
    /// false if the row changed hands or got bound in the meantime.
    async fn replace_claim(
        &self,
        reference: &str,
        old_token: Uuid,
        row: ClaimRow,
    ) -> Result<bool, StoreError>;

    /// Record the committed transaction on a claim owned by `token`.
    async fn bind_claim(
        &self,
        reference: &str,
        token: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Drop an unbound claim owned by `token`. Returns false if it was
    /// already gone, bound or taken over.
    async fn release_claim(&self, reference: &str, token: Uuid) -> Result<bool, StoreError>;

    /// Delete claims whose TTL has passed. Returns how many went.
    async fn delete_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_is_retryable() {
        let conflict = StoreError::VersionConflict {
            account_id: Uuid::new_v4(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_version_conflict());

        let not_found = StoreError::AccountNotFound(Uuid::new_v4());
        assert!(!not_found.is_retryable());

        let duplicate = StoreError::DuplicateReference("TX_1".into());
        assert!(!duplicate.is_retryable());
    }
}
