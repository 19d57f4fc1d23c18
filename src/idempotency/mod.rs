//! Idempotency guard
//!
//! Claim-first deduplication of external references. A reference is claimed
//! before any work happens; the claim is bound to its transaction at commit
//! and the transaction row stays the permanent replay authority after the
//! claim expires. Claims left unbound by a crashed worker are taken over
//! once the takeover window passes.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::domain::{Amount, Transaction, TransactionKind};
use crate::error::{WalletError, WalletResult};
use crate::store::{ClaimInsert, ClaimRow, WalletStore};

/// Proof of claim ownership. Only the holder can bind or release.
#[derive(Debug, Clone)]
pub struct ClaimTicket {
    reference: String,
    token: Uuid,
}

impl ClaimTicket {
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

/// Outcome of reserving a reference.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// The reference is ours. Proceed, then bind on commit or release on
    /// pre-commit failure.
    Fresh(ClaimTicket),

    /// The reference already has a committed transaction with the same
    /// parameters; hand its stored result back instead of redoing work.
    Replay(Transaction),
}

/// Claim-first reference deduplication over the wallet store.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn WalletStore>,
    claim_ttl: Duration,
    takeover_after: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn WalletStore>, claim_ttl: Duration, takeover_after: Duration) -> Self {
        Self {
            store,
            claim_ttl,
            takeover_after,
        }
    }

    /// Reserve `reference` for an operation with the given fingerprint.
    ///
    /// Exactly one caller per reference gets `Fresh` at a time. Reusing a
    /// committed reference with identical parameters yields `Replay`;
    /// different parameters are refused outright.
    pub async fn reserve(
        &self,
        reference: &str,
        fingerprint: &str,
    ) -> WalletResult<Reservation> {
        // The transaction row outlives any claim, so consult it first.
        if let Some(existing) = self
            .store
            .fetch_transaction_by_reference(reference)
            .await?
        {
            return self.replay_or_reject(existing, fingerprint);
        }

        let now = Utc::now();
        let row = ClaimRow {
            reference: reference.to_string(),
            fingerprint: fingerprint.to_string(),
            token: Uuid::new_v4(),
            transaction_id: None,
            claimed_at: now,
            expires_at: now + self.claim_ttl,
        };
        let ticket = ClaimTicket {
            reference: reference.to_string(),
            token: row.token,
        };

        match self.store.insert_claim(row).await? {
            ClaimInsert::Inserted => Ok(Reservation::Fresh(ticket)),
            ClaimInsert::Existing(existing) => {
                self.contend_for_claim(reference, fingerprint, existing).await
            }
        }
    }

    /// Another claim holds the reference. Decide between replay, refusal,
    /// in-flight and stale takeover.
    async fn contend_for_claim(
        &self,
        reference: &str,
        fingerprint: &str,
        existing: ClaimRow,
    ) -> WalletResult<Reservation> {
        if let Some(transaction_id) = existing.transaction_id {
            let transaction = self
                .store
                .fetch_transaction(transaction_id)
                .await?
                .ok_or_else(|| {
                    WalletError::Internal(format!(
                        "claim for {reference} bound to missing transaction {transaction_id}"
                    ))
                })?;
            return self.replay_or_reject(transaction, fingerprint);
        }

        if existing.fingerprint != fingerprint {
            return Err(WalletError::ReferenceReuse(reference.to_string()));
        }

        let age = Utc::now() - existing.claimed_at;
        if age < self.takeover_after {
            return Err(WalletError::ReferenceInFlight(reference.to_string()));
        }

        // The original claimer has been silent past the takeover window;
        // assume it died before committing and take the claim over.
        let now = Utc::now();
        let replacement = ClaimRow {
            reference: reference.to_string(),
            fingerprint: fingerprint.to_string(),
            token: Uuid::new_v4(),
            transaction_id: None,
            claimed_at: now,
            expires_at: now + self.claim_ttl,
        };
        let ticket = ClaimTicket {
            reference: reference.to_string(),
            token: replacement.token,
        };

        if self
            .store
            .replace_claim(reference, existing.token, replacement)
            .await?
        {
            tracing::warn!(
                reference,
                stale_for_secs = age.num_seconds(),
                "Took over stale unbound claim"
            );
            Ok(Reservation::Fresh(ticket))
        } else {
            // Lost the takeover race to another worker.
            Err(WalletError::ReferenceInFlight(reference.to_string()))
        }
    }

    fn replay_or_reject(
        &self,
        transaction: Transaction,
        fingerprint: &str,
    ) -> WalletResult<Reservation> {
        // Compare against what the caller asked for, not what settled:
        // top-up settlement may have replaced the amount with the
        // provider-verified figure, and a retry of the original request
        // must still replay.
        let stored = Self::fingerprint(
            transaction.account_id,
            transaction.kind,
            &transaction.requested_amount(),
        );
        if stored == fingerprint {
            Ok(Reservation::Replay(transaction))
        } else {
            Err(WalletError::ReferenceReuse(transaction.reference))
        }
    }

    /// Record the committed transaction on the claim.
    ///
    /// A false CAS here means the claim was taken over after our commit
    /// won; the transaction row already guards the reference, so this is
    /// log-worthy but not fatal.
    pub async fn bind(&self, ticket: &ClaimTicket, transaction_id: Uuid) -> WalletResult<()> {
        let bound = self
            .store
            .bind_claim(&ticket.reference, ticket.token, transaction_id)
            .await?;
        if !bound {
            tracing::warn!(
                reference = %ticket.reference,
                %transaction_id,
                "Claim changed hands before bind; transaction row remains authoritative"
            );
        }
        Ok(())
    }

    /// Free the reference after a pre-commit validation failure, so the
    /// caller can correct the request and reuse it.
    pub async fn release(&self, ticket: &ClaimTicket) -> WalletResult<()> {
        let released = self
            .store
            .release_claim(&ticket.reference, ticket.token)
            .await?;
        if !released {
            tracing::warn!(
                reference = %ticket.reference,
                "Release found no owned unbound claim"
            );
        }
        Ok(())
    }

    /// Drop claims whose TTL has passed. Committed references stay
    /// protected by the transactions table.
    pub async fn sweep_expired(&self) -> WalletResult<u64> {
        Ok(self.store.delete_expired_claims(Utc::now()).await?)
    }

    /// Parameter fingerprint of an operation: SHA-256 over the identity
    /// that must not change under a reused reference.
    pub fn fingerprint(account_id: Uuid, kind: TransactionKind, amount: &Amount) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(account_id.as_bytes());
        hasher.update(kind.as_str().as_bytes());
        hasher.update(amount.kobo().to_be_bytes());
        hex::encode(hasher.finalize())
    }
}
