//! In-memory wallet store
//!
//! Backs the test suites and the soak binary. Writes are serialized per
//! account, never globally: each account owns a slot guarded by its own
//! mutex, and the version check runs under that lock so the optimistic
//! retry path behaves exactly as it does against the durable store. Locks
//! are only ever held across the synchronous apply step, never across an
//! await point.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::{Account, AccountStatus, LedgerEntry, Transaction, TransactionStatus};

use super::{
    ClaimInsert, ClaimRow, CommitRequest, StoreError, TransactionWrite, WalletStore,
};

/// One account's state: the projection row plus its ledger, in commit order.
#[derive(Debug)]
struct AccountSlot {
    account: Account,
    entries: Vec<LedgerEntry>,
}

/// In-process store over concurrent maps.
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<Uuid, Arc<Mutex<AccountSlot>>>,
    transactions: DashMap<Uuid, Transaction>,
    by_reference: DashMap<String, Uuid>,
    claims: DashMap<String, ClaimRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, account_id: Uuid) -> Result<Arc<Mutex<AccountSlot>>, StoreError> {
        self.accounts
            .get(&account_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(StoreError::AccountNotFound(account_id))
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.accounts.entry(account.id) {
            Entry::Occupied(_) => Err(StoreError::Corrupt(format!(
                "account {} already inserted",
                account.id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(AccountSlot {
                    account: account.clone(),
                    entries: Vec::new(),
                })));
                Ok(())
            }
        }
    }

    async fn fetch_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        match self.accounts.get(&account_id) {
            Some(slot) => Ok(Some(slot.lock().account.clone())),
            None => Ok(None),
        }
    }

    async fn set_account_status(
        &self,
        account_id: Uuid,
        status: AccountStatus,
    ) -> Result<(), StoreError> {
        let slot = self.slot(account_id)?;
        let mut guard = slot.lock();
        guard.account.status = status;
        guard.account.updated_at = Utc::now();
        Ok(())
    }

    async fn commit(&self, request: CommitRequest) -> Result<(), StoreError> {
        let slot = self.slot(request.account_id)?;
        let mut guard = slot.lock();

        // The version check is the serialization point.
        if guard.account.version != request.expected_version {
            return Err(StoreError::VersionConflict {
                account_id: request.account_id,
                expected: request.expected_version,
                actual: guard.account.version,
            });
        }

        debug_assert_eq!(request.entry.seq, request.expected_version + 1);
        debug_assert_eq!(request.entry.balance_after, request.new_balance);
        debug_assert_eq!(request.entry.account_id, request.account_id);

        // Validate the transaction side before anything is applied.
        let transaction = match &request.transaction {
            TransactionWrite::Insert(tx) => {
                use dashmap::mapref::entry::Entry;
                match self.by_reference.entry(tx.reference.clone()) {
                    Entry::Occupied(_) => {
                        return Err(StoreError::DuplicateReference(tx.reference.clone()))
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(tx.id);
                    }
                }
                tx.clone()
            }
            TransactionWrite::Update {
                expected_status,
                transaction,
            } => {
                let stored = self
                    .transactions
                    .get(&transaction.id)
                    .map(|t| t.status)
                    .ok_or(StoreError::TransactionNotFound(transaction.id))?;
                if stored != *expected_status {
                    return Err(StoreError::StatusConflict {
                        transaction_id: transaction.id,
                        expected: *expected_status,
                        actual: stored,
                    });
                }
                transaction.clone()
            }
        };

        guard.entries.push(request.entry);
        guard.account.balance = request.new_balance;
        guard.account.version = request.expected_version + 1;
        guard.account.updated_at = Utc::now();
        self.transactions.insert(transaction.id, transaction);

        Ok(())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.by_reference.entry(transaction.reference.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateReference(
                transaction.reference.clone(),
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(transaction.id);
                self.transactions
                    .insert(transaction.id, transaction.clone());
                Ok(())
            }
        }
    }

    async fn finalize_transaction(
        &self,
        expected_status: TransactionStatus,
        transaction: &Transaction,
    ) -> Result<bool, StoreError> {
        match self.transactions.get_mut(&transaction.id) {
            Some(mut stored) => {
                if stored.status != expected_status {
                    return Ok(false);
                }
                *stored = transaction.clone();
                Ok(true)
            }
            None => Err(StoreError::TransactionNotFound(transaction.id)),
        }
    }

    async fn fetch_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self.transactions.get(&transaction_id).map(|t| t.clone()))
    }

    async fn fetch_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        match self.by_reference.get(reference) {
            Some(id) => Ok(self.transactions.get(&id).map(|t| t.clone())),
            None => Ok(None),
        }
    }

    async fn transactions_for_account(
        &self,
        account_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .filter(|t| before.map_or(true, |cutoff| t.created_at < cutoff))
            .map(|t| t.clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn transactions_in_status_since(
        &self,
        status: TransactionStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.status == status && t.updated_at < older_than)
            .map(|t| t.clone())
            .collect();
        matching.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn entries_for_account(
        &self,
        account_id: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let slot = self.slot(account_id)?;
        let guard = slot.lock();
        let page: Vec<LedgerEntry> = guard
            .entries
            .iter()
            .rev()
            .filter(|e| before_seq.map_or(true, |cursor| e.seq < cursor))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(page)
    }

    async fn head_entry(&self, account_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let slot = self.slot(account_id)?;
        let guard = slot.lock();
        Ok(guard.entries.last().cloned())
    }

    async fn insert_claim(&self, row: ClaimRow) -> Result<ClaimInsert, StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.claims.entry(row.reference.clone()) {
            Entry::Occupied(occupied) => Ok(ClaimInsert::Existing(occupied.get().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(row);
                Ok(ClaimInsert::Inserted)
            }
        }
    }

    async fn fetch_claim(&self, reference: &str) -> Result<Option<ClaimRow>, StoreError> {
        Ok(self.claims.get(reference).map(|c| c.clone()))
    }

    async fn replace_claim(
        &self,
        reference: &str,
        old_token: Uuid,
        row: ClaimRow,
    ) -> Result<bool, StoreError> {
        match self.claims.get_mut(reference) {
            Some(mut claim) if claim.token == old_token && claim.transaction_id.is_none() => {
                *claim = row;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bind_claim(
        &self,
        reference: &str,
        token: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, StoreError> {
        match self.claims.get_mut(reference) {
            Some(mut claim) if claim.token == token && claim.transaction_id.is_none() => {
                claim.transaction_id = Some(transaction_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, reference: &str, token: Uuid) -> Result<bool, StoreError> {
        let removed = self
            .claims
            .remove_if(reference, |_, claim| {
                claim.token == token && claim.transaction_id.is_none()
            })
            .is_some();
        Ok(removed)
    }

    async fn delete_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        self.claims.retain(|_, claim| {
            if claim.expires_at < now {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Amount, Balance, EntryDirection, OperationContext, TransactionKind,
    };
    use chrono::Duration;

    async fn store_with_account() -> (MemoryStore, Account) {
        let store = MemoryStore::new();
        let account = Account::open("test-holder");
        store.insert_account(&account).await.unwrap();
        (store, account)
    }

    fn credit_commit(account: &Account, amount_kobo: i64, reference: &str) -> CommitRequest {
        let amount = Amount::from_kobo(amount_kobo).unwrap();
        let new_balance = account.balance.credit(&amount).unwrap();
        let tx = Transaction::new(
            account.id,
            TransactionKind::WalletFund,
            reference,
            amount,
            serde_json::json!({}),
            OperationContext::new(),
        );
        let entry = LedgerEntry::new(
            account.id,
            tx.id,
            account.version + 1,
            EntryDirection::Credit,
            amount,
            new_balance,
            "fund",
        );
        CommitRequest {
            account_id: account.id,
            expected_version: account.version,
            new_balance,
            entry,
            transaction: TransactionWrite::Insert(tx),
        }
    }

    #[tokio::test]
    async fn test_commit_applies_entry_balance_and_transaction() {
        let (store, account) = store_with_account().await;

        store
            .commit(credit_commit(&account, 5_000, "FUND_a"))
            .await
            .unwrap();

        let stored = store.fetch_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Balance::new(5_000).unwrap());
        assert_eq!(stored.version, 1);

        let head = store.head_entry(account.id).await.unwrap().unwrap();
        assert_eq!(head.seq, 1);
        assert_eq!(head.balance_after, stored.balance);

        let tx = store
            .fetch_transaction_by_reference("FUND_a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.account_id, account.id);
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let (store, account) = store_with_account().await;

        store
            .commit(credit_commit(&account, 5_000, "FUND_a"))
            .await
            .unwrap();

        // Built against version 0, but the account is at 1 now.
        let err = store
            .commit(credit_commit(&account, 5_000, "FUND_b"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        // Nothing from the failed commit may be visible.
        assert!(store
            .fetch_transaction_by_reference("FUND_b")
            .await
            .unwrap()
            .is_none());
        let stored = store.fetch_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_duplicate_reference() {
        let (store, account) = store_with_account().await;

        store
            .commit(credit_commit(&account, 5_000, "FUND_a"))
            .await
            .unwrap();

        let account = store.fetch_account(account.id).await.unwrap().unwrap();
        let err = store
            .commit(credit_commit(&account, 5_000, "FUND_a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReference(_)));
    }

    #[tokio::test]
    async fn test_finalize_transaction_is_a_status_cas() {
        let (store, account) = store_with_account().await;
        store
            .commit(credit_commit(&account, 5_000, "FUND_a"))
            .await
            .unwrap();

        let mut tx = store
            .fetch_transaction_by_reference("FUND_a")
            .await
            .unwrap()
            .unwrap();
        tx.transition(TransactionStatus::Settled).unwrap();

        let won = store
            .finalize_transaction(TransactionStatus::Pending, &tx)
            .await
            .unwrap();
        assert!(won);

        // Second CAS against the old status loses.
        let lost = store
            .finalize_transaction(TransactionStatus::Pending, &tx)
            .await
            .unwrap();
        assert!(!lost);
    }

    #[tokio::test]
    async fn test_entries_pagination_newest_first() {
        let (store, mut account) = store_with_account().await;
        for i in 0..5 {
            store
                .commit(credit_commit(&account, 1_000, &format!("FUND_{i}")))
                .await
                .unwrap();
            account = store.fetch_account(account.id).await.unwrap().unwrap();
        }

        let first = store.entries_for_account(account.id, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].seq, 5);
        assert_eq!(first[1].seq, 4);

        let second = store
            .entries_for_account(account.id, Some(first[1].seq), 2)
            .await
            .unwrap();
        assert_eq!(second[0].seq, 3);
        assert_eq!(second[1].seq, 2);

        let last = store
            .entries_for_account(account.id, Some(second[1].seq), 2)
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].seq, 1);
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let token = Uuid::new_v4();
        let row = ClaimRow {
            reference: "TX_1".into(),
            fingerprint: "abc".into(),
            token,
            transaction_id: None,
            claimed_at: now,
            expires_at: now + Duration::hours(24),
        };

        assert!(matches!(
            store.insert_claim(row.clone()).await.unwrap(),
            ClaimInsert::Inserted
        ));
        assert!(matches!(
            store.insert_claim(row.clone()).await.unwrap(),
            ClaimInsert::Existing(_)
        ));

        // Binding with the wrong token must fail.
        let tx_id = Uuid::new_v4();
        assert!(!store.bind_claim("TX_1", Uuid::new_v4(), tx_id).await.unwrap());
        assert!(store.bind_claim("TX_1", token, tx_id).await.unwrap());

        // A bound claim can be neither released nor taken over.
        assert!(!store.release_claim("TX_1", token).await.unwrap());
        let steal = ClaimRow {
            token: Uuid::new_v4(),
            ..row.clone()
        };
        assert!(!store.replace_claim("TX_1", token, steal).await.unwrap());

        let bound = store.fetch_claim("TX_1").await.unwrap().unwrap();
        assert_eq!(bound.transaction_id, Some(tx_id));
    }

    #[tokio::test]
    async fn test_claim_expiry_sweep() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (reference, expires_at) in [
            ("OLD", now - Duration::hours(1)),
            ("LIVE", now + Duration::hours(1)),
        ] {
            store
                .insert_claim(ClaimRow {
                    reference: reference.into(),
                    fingerprint: String::new(),
                    token: Uuid::new_v4(),
                    transaction_id: None,
                    claimed_at: now - Duration::hours(2),
                    expires_at,
                })
                .await
                .unwrap();
        }

        let removed = store.delete_expired_claims(now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.fetch_claim("OLD").await.unwrap().is_none());
        assert!(store.fetch_claim("LIVE").await.unwrap().is_some());
    }
}
