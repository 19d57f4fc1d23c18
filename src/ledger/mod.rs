//! Ledger
//!
//! Append-only balance mutation over the wallet store. `append` is the only
//! way money moves: it recomputes the balance from a fresh account read on
//! every attempt, so the committed entry is always derived from the state
//! the version check validated. The store's version check stays the final
//! arbiter for funds sufficiency; a passing pre-check in the engine can
//! never smuggle an overdraft past a concurrent debit.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::domain::{
    Account, Amount, AmountError, Balance, EntryDirection, LedgerEntry,
};
use crate::error::{WalletError, WalletResult};
use crate::store::{CommitRequest, StoreError, TransactionWrite, WalletStore};

/// Attempts before a version conflict is reported as contention.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Base backoff between attempts; grows linearly per attempt.
const RETRY_BACKOFF_MS: u64 = 50;

/// Largest history page a caller can ask for.
pub const MAX_PAGE_SIZE: i64 = 100;

/// A committed mutation.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub entry: LedgerEntry,
    pub new_balance: Balance,
    pub version: i64,
}

/// One page of ledger history, newest first.
#[derive(Debug, Clone)]
pub struct EntryPage {
    pub entries: Vec<LedgerEntry>,
    /// Pass back as the cursor to continue. None means the ledger is
    /// exhausted.
    pub next_cursor: Option<i64>,
}

/// Conservation audit result for one account.
#[derive(Debug, Clone)]
pub struct ConservationReport {
    pub account_id: Uuid,
    pub entry_count: u64,
    /// Sum of signed entry amounts.
    pub computed_kobo: i64,
    /// Balance on the account row.
    pub recorded_kobo: i64,
    /// `balance_after` of the newest entry, if any entry exists.
    pub head_kobo: Option<i64>,
    pub breaks: Vec<String>,
}

impl ConservationReport {
    /// True when the replayed ledger, the account row and the head entry
    /// all agree and the entry chain is intact.
    pub fn is_consistent(&self) -> bool {
        self.breaks.is_empty()
            && self.computed_kobo == self.recorded_kobo
            && self.head_kobo.map_or(self.computed_kobo == 0, |head| {
                head == self.computed_kobo
            })
    }
}

/// The append-only ledger over a wallet store.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn WalletStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn WalletStore> {
        &self.store
    }

    /// Append one entry and its transaction write atomically.
    ///
    /// Retries version conflicts with linear backoff, rebuilding the entry
    /// from a fresh account read each time. Funds sufficiency is decided
    /// here, inside the serialized section, never from stale reads.
    pub async fn append(
        &self,
        account_id: Uuid,
        direction: EntryDirection,
        amount: Amount,
        description: &str,
        write: TransactionWrite,
    ) -> WalletResult<AppendOutcome> {
        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let account = self
                .store
                .fetch_account(account_id)
                .await?
                .ok_or(WalletError::AccountNotFound(account_id))?;

            let new_balance = self.apply_direction(&account, direction, &amount)?;
            let entry = LedgerEntry::new(
                account_id,
                write.transaction().id,
                account.version + 1,
                direction,
                amount,
                new_balance,
                description,
            );

            let request = CommitRequest {
                account_id,
                expected_version: account.version,
                new_balance,
                entry: entry.clone(),
                transaction: write.clone(),
            };

            match self.store.commit(request).await {
                Ok(()) => {
                    return Ok(AppendOutcome {
                        entry,
                        new_balance,
                        version: account.version + 1,
                    })
                }
                Err(StoreError::VersionConflict { .. }) if attempt < MAX_COMMIT_ATTEMPTS - 1 => {
                    let delay = Duration::from_millis(RETRY_BACKOFF_MS * (attempt as u64 + 1));
                    tokio::time::sleep(delay).await;
                    tracing::warn!(
                        account_id = %account_id,
                        "Version conflict on append, retrying (attempt {}/{})",
                        attempt + 1,
                        MAX_COMMIT_ATTEMPTS
                    );
                    continue;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(WalletError::Contention(account_id))
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(WalletError::Contention(account_id))
    }

    fn apply_direction(
        &self,
        account: &Account,
        direction: EntryDirection,
        amount: &Amount,
    ) -> WalletResult<Balance> {
        match direction {
            EntryDirection::Credit => account
                .balance
                .credit(amount)
                .map_err(WalletError::InvalidAmount),
            EntryDirection::Debit => account.balance.debit(amount).map_err(|e| match e {
                AmountError::Negative(_) => WalletError::InsufficientFunds {
                    account_id: account.id,
                    required: amount.kobo(),
                    available: account.balance.kobo(),
                },
                other => WalletError::InvalidAmount(other),
            }),
        }
    }

    /// Current balance as committed, from the account row.
    pub async fn current_balance(&self, account_id: Uuid) -> WalletResult<Balance> {
        let account = self
            .store
            .fetch_account(account_id)
            .await?
            .ok_or(WalletError::AccountNotFound(account_id))?;
        Ok(account.balance)
    }

    /// Ledger history, newest first, cursor-paginated over the entry
    /// sequence. `limit` is clamped to [`MAX_PAGE_SIZE`].
    pub async fn history(
        &self,
        account_id: Uuid,
        cursor: Option<i64>,
        limit: i64,
    ) -> WalletResult<EntryPage> {
        // An account with no entries is a valid empty history.
        if self.store.fetch_account(account_id).await?.is_none() {
            return Err(WalletError::AccountNotFound(account_id));
        }

        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let entries = self
            .store
            .entries_for_account(account_id, cursor, limit)
            .await?;

        let next_cursor = if entries.len() as i64 == limit {
            entries.last().map(|e| e.seq).filter(|seq| *seq > 1)
        } else {
            None
        };

        Ok(EntryPage {
            entries,
            next_cursor,
        })
    }

    /// Replay the whole ledger of one account and cross-check it against
    /// the projected balance and the head entry.
    pub async fn verify_conservation(&self, account_id: Uuid) -> WalletResult<ConservationReport> {
        const AUDIT_PAGE: i64 = 500;

        let account = self
            .store
            .fetch_account(account_id)
            .await?
            .ok_or(WalletError::AccountNotFound(account_id))?;

        let mut breaks = Vec::new();
        let mut entry_count = 0u64;
        let mut computed: i64 = 0;
        let mut head_kobo: Option<i64> = None;
        // Walking newest to oldest: the younger neighbour of the entry
        // under inspection.
        let mut newer: Option<LedgerEntry> = None;
        let mut cursor: Option<i64> = None;

        loop {
            let page = self
                .store
                .entries_for_account(account_id, cursor, AUDIT_PAGE)
                .await?;
            if page.is_empty() {
                break;
            }

            for entry in &page {
                entry_count += 1;
                computed += entry.signed_kobo();
                if head_kobo.is_none() {
                    head_kobo = Some(entry.balance_after.kobo());
                }

                if let Some(newer) = &newer {
                    if newer.seq != entry.seq + 1 {
                        breaks.push(format!(
                            "sequence gap between seq {} and seq {}",
                            entry.seq, newer.seq
                        ));
                    }
                    if newer.balance_after.kobo() - newer.signed_kobo()
                        != entry.balance_after.kobo()
                    {
                        breaks.push(format!(
                            "balance chain broken at seq {}: {} then {}",
                            newer.seq,
                            entry.balance_after.kobo(),
                            newer.balance_after.kobo()
                        ));
                    }
                }
                newer = Some(entry.clone());
            }

            cursor = page.last().map(|e| e.seq);
            if page.len() < AUDIT_PAGE as usize {
                break;
            }
        }

        // The oldest entry starts from an empty ledger.
        if let Some(oldest) = &newer {
            if oldest.seq != 1 {
                breaks.push(format!("ledger does not start at seq 1 (found {})", oldest.seq));
            }
            if oldest.balance_after.kobo() != oldest.signed_kobo() {
                breaks.push(format!(
                    "first entry balance_after {} does not match its own effect {}",
                    oldest.balance_after.kobo(),
                    oldest.signed_kobo()
                ));
            }
        }

        Ok(ConservationReport {
            account_id,
            entry_count,
            computed_kobo: computed,
            recorded_kobo: account.balance.kobo(),
            head_kobo,
            breaks,
        })
    }
}
