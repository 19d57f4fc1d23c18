//! Transaction engine
//!
//! Orchestrates every balance mutation. Spends debit the wallet before the
//! provider is called, so the provider can never deliver against money that
//! was not there; top-ups credit only after the provider has verified the
//! payment. Both directions run reference-first through the idempotency
//! guard, and anything the hot path cannot finish is left in a state the
//! reconciliation pass can resolve.

pub mod commands;

pub use commands::{
    CommandReceipt, ConfirmTopUpCommand, FailTopUpCommand, SpendCommand, TopUpCommand,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::WalletConfig;
use crate::domain::{
    generate_reference, Account, AccountStatus, Amount, Balance, EntryDirection,
    OperationContext, Transaction, TransactionKind, TransactionStatus,
};
use crate::error::{WalletError, WalletResult};
use crate::idempotency::{ClaimTicket, IdempotencyGuard, Reservation};
use crate::ledger::{ConservationReport, EntryPage, Ledger, MAX_PAGE_SIZE};
use crate::provider::{ProviderGateway, ProviderOutcome, ProviderRequest, ProviderResult};
use crate::store::{StoreError, TransactionWrite, WalletStore};

/// What reconciliation did with one stuck transaction.
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// Requery confirmed delivery; the transaction settled.
    Settled(Transaction),

    /// Requery confirmed failure; funds are back where they started.
    Reversed(Transaction),

    /// The requery window expired without an answer. Funds were returned
    /// by force and the case logged for manual review.
    ForcedReversal(Transaction),

    /// Still no definitive answer, still inside the window; next pass.
    LeftParked,

    /// Another worker finalized it first.
    AlreadyFinal,
}

fn receipt_json(result: &ProviderResult) -> WalletResult<serde_json::Value> {
    serde_json::to_value(result)
        .map_err(|e| WalletError::Internal(format!("receipt serialization: {e}")))
}

fn reversal_action(stored: Transaction, performed: bool, forced: bool) -> ReconcileAction {
    if performed {
        if forced {
            ReconcileAction::ForcedReversal(stored)
        } else {
            ReconcileAction::Reversed(stored)
        }
    } else if stored.is_terminal() {
        ReconcileAction::AlreadyFinal
    } else {
        ReconcileAction::LeftParked
    }
}

/// The write surface of the wallet.
///
/// Cheap to clone; all clones share the same store, guard and provider.
#[derive(Clone)]
pub struct TransactionEngine {
    store: Arc<dyn WalletStore>,
    ledger: Ledger,
    guard: IdempotencyGuard,
    provider: Arc<dyn ProviderGateway>,
    provider_timeout: Duration,
}

impl TransactionEngine {
    pub fn new(
        store: Arc<dyn WalletStore>,
        provider: Arc<dyn ProviderGateway>,
        config: &WalletConfig,
    ) -> Self {
        Self {
            ledger: Ledger::new(Arc::clone(&store)),
            guard: IdempotencyGuard::new(
                Arc::clone(&store),
                config.claim_ttl(),
                config.claim_takeover(),
            ),
            store,
            provider,
            provider_timeout: config.provider_timeout(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn store(&self) -> &Arc<dyn WalletStore> {
        &self.store
    }

    // -- accounts --

    /// Open a wallet with a zero balance.
    pub async fn open_account(&self, holder: &str) -> WalletResult<Account> {
        let holder = holder.trim();
        if holder.is_empty() {
            return Err(WalletError::InvalidRequest(
                "holder must not be empty".to_string(),
            ));
        }
        let account = Account::open(holder);
        self.store.insert_account(&account).await?;
        tracing::info!(account_id = %account.id, holder = %account.holder, "Account opened");
        Ok(account)
    }

    /// Stop new spends and top-ups. Settlements already in flight still land.
    pub async fn disable_account(&self, account_id: Uuid) -> WalletResult<Account> {
        self.set_status(account_id, AccountStatus::Disabled).await
    }

    pub async fn enable_account(&self, account_id: Uuid) -> WalletResult<Account> {
        self.set_status(account_id, AccountStatus::Active).await
    }

    async fn set_status(
        &self,
        account_id: Uuid,
        status: AccountStatus,
    ) -> WalletResult<Account> {
        match self.store.set_account_status(account_id, status).await {
            Ok(()) => {}
            Err(StoreError::AccountNotFound(id)) => return Err(WalletError::AccountNotFound(id)),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(account_id = %account_id, status = %status, "Account status changed");
        self.account(account_id).await
    }

    // -- queries --

    pub async fn account(&self, account_id: Uuid) -> WalletResult<Account> {
        self.store
            .fetch_account(account_id)
            .await?
            .ok_or(WalletError::AccountNotFound(account_id))
    }

    pub async fn balance(&self, account_id: Uuid) -> WalletResult<Balance> {
        self.ledger.current_balance(account_id).await
    }

    /// Ledger history, newest first, cursor-paginated.
    pub async fn history(
        &self,
        account_id: Uuid,
        cursor: Option<i64>,
        limit: i64,
    ) -> WalletResult<EntryPage> {
        self.ledger.history(account_id, cursor, limit).await
    }

    pub async fn transaction(&self, transaction_id: Uuid) -> WalletResult<Transaction> {
        self.stored_transaction(transaction_id).await
    }

    pub async fn transaction_by_reference(&self, reference: &str) -> WalletResult<Transaction> {
        self.store
            .fetch_transaction_by_reference(reference)
            .await?
            .ok_or_else(|| WalletError::ReferenceNotFound(reference.to_string()))
    }

    /// Transactions for an account, newest first. `before` is an exclusive
    /// created-at cursor.
    pub async fn transactions(
        &self,
        account_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> WalletResult<Vec<Transaction>> {
        self.account(account_id).await?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(self
            .store
            .transactions_for_account(account_id, before, limit)
            .await?)
    }

    /// Audit one account's entry chain against its projected balance.
    pub async fn verify_conservation(&self, account_id: Uuid) -> WalletResult<ConservationReport> {
        self.ledger.verify_conservation(account_id).await
    }

    // -- spends --

    /// Spend wallet funds through the fulfilment provider.
    ///
    /// The debit commits before the provider is called. A definitive
    /// provider failure is compensated with a credit right away; an unknown
    /// outcome leaves the reservation standing for
    /// [`reconcile_transaction`](Self::reconcile_transaction). Replaying a
    /// committed reference returns the stored transaction without touching
    /// the provider again.
    pub async fn initiate_spend(&self, command: SpendCommand) -> WalletResult<CommandReceipt> {
        if !command.kind.is_spend() {
            return Err(WalletError::InvalidRequest(format!(
                "{} is not a spend kind",
                command.kind
            )));
        }
        let reference = command.reference.trim();
        if reference.is_empty() {
            return Err(WalletError::InvalidRequest(
                "reference must not be empty".to_string(),
            ));
        }
        let amount = Amount::from_kobo(command.amount_kobo)?;
        let fingerprint =
            IdempotencyGuard::fingerprint(command.account_id, command.kind, &amount);

        let ticket = match self.guard.reserve(reference, &fingerprint).await? {
            Reservation::Replay(stored) => {
                tracing::info!(reference = %reference, transaction_id = %stored.id, "Spend replayed");
                return Ok(CommandReceipt::replay(stored));
            }
            Reservation::Fresh(ticket) => ticket,
        };

        if let Err(err) = self.spend_prechecks(command.account_id, &amount).await {
            self.release_quietly(&ticket).await;
            return Err(err);
        }

        let mut context = command.context.clone();
        context.ensure_correlation_id();

        let mut transaction = Transaction::new(
            command.account_id,
            command.kind,
            reference,
            amount,
            command.details.clone(),
            context,
        );
        transaction.transition(TransactionStatus::Reserved)?;

        let appended = self
            .ledger
            .append(
                command.account_id,
                EntryDirection::Debit,
                amount,
                &format!("{} {}", command.kind, reference),
                TransactionWrite::Insert(transaction.clone()),
            )
            .await;

        if let Err(err) = appended {
            return self.recover_spend_commit(&ticket, &fingerprint, err).await;
        }

        self.bind_quietly(&ticket, transaction.id).await;
        tracing::info!(
            account_id = %command.account_id,
            reference = %reference,
            amount_kobo = amount.kobo(),
            "Spend reserved"
        );

        // Settlement runs on its own task, so a caller that gives up on the
        // await cannot abort a provider call that may already be delivering.
        let engine = self.clone();
        let reserved = transaction.clone();
        let settlement = tokio::spawn(async move { engine.settle_reserved_spend(reserved).await });

        match settlement.await {
            Ok(settled) => settled.map(CommandReceipt::fresh),
            Err(join_error) => Err(WalletError::Internal(format!(
                "settlement task for {} failed: {join_error}",
                transaction.reference
            ))),
        }
    }

    /// Advisory pre-checks before money is reserved. The commit inside the
    /// ledger remains the final arbiter for funds.
    async fn spend_prechecks(&self, account_id: Uuid, amount: &Amount) -> WalletResult<()> {
        let account = self.active_account(account_id).await?;
        if !account.balance.is_sufficient_for(amount) {
            return Err(WalletError::InsufficientFunds {
                account_id,
                required: amount.kobo(),
                available: account.balance.kobo(),
            });
        }
        Ok(())
    }

    async fn active_account(&self, account_id: Uuid) -> WalletResult<Account> {
        let account = self.account(account_id).await?;
        if !account.is_active() {
            return Err(WalletError::AccountDisabled(account_id));
        }
        Ok(account)
    }

    /// A spend commit failed while we held the claim. Provable non-commits
    /// free the claim for a corrected retry; a duplicate reference means a
    /// rival worker committed first and the transaction row now speaks for
    /// the reference.
    async fn recover_spend_commit(
        &self,
        ticket: &ClaimTicket,
        fingerprint: &str,
        err: WalletError,
    ) -> WalletResult<CommandReceipt> {
        match err {
            WalletError::Store(StoreError::DuplicateReference(_)) => {
                self.replay_committed_reference(ticket, fingerprint).await
            }
            err @ (WalletError::AccountNotFound(_)
            | WalletError::InsufficientFunds { .. }
            | WalletError::InvalidAmount(_)
            | WalletError::Contention(_)) => {
                self.release_quietly(ticket).await;
                Err(err)
            }
            // Anything else is ambiguous about whether the commit landed;
            // the claim stays until takeover or the sweeper reclaims it.
            err => Err(err),
        }
    }

    async fn replay_committed_reference(
        &self,
        ticket: &ClaimTicket,
        fingerprint: &str,
    ) -> WalletResult<CommandReceipt> {
        let reference = ticket.reference();
        let stored = self
            .store
            .fetch_transaction_by_reference(reference)
            .await?
            .ok_or_else(|| {
                WalletError::Internal(format!("reference {reference} is committed but unreadable"))
            })?;
        if IdempotencyGuard::fingerprint(stored.account_id, stored.kind, &stored.requested_amount())
            == fingerprint
        {
            self.bind_quietly(ticket, stored.id).await;
            Ok(CommandReceipt::replay(stored))
        } else {
            self.release_quietly(ticket).await;
            Err(WalletError::ReferenceReuse(reference.to_string()))
        }
    }

    /// Drive one reserved spend through the provider and finalize it.
    async fn settle_reserved_spend(&self, transaction: Transaction) -> WalletResult<Transaction> {
        let request = ProviderRequest {
            transaction_id: transaction.id,
            reference: transaction.reference.clone(),
            kind: transaction.kind,
            amount: transaction.amount,
            details: transaction.details.clone(),
        };

        let answer = tokio::time::timeout(self.provider_timeout, self.provider.execute(&request));
        let result = match answer.await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(reference = %transaction.reference, error = %err, "Provider call failed");
                return self.park_reservation(transaction, None).await;
            }
            Err(_) => {
                tracing::warn!(reference = %transaction.reference, "Provider call timed out");
                return self.park_reservation(transaction, None).await;
            }
        };

        match result.outcome {
            ProviderOutcome::Success => {
                let (stored, _) = self.settle_spend(transaction, result).await?;
                Ok(stored)
            }
            ProviderOutcome::Failure => {
                let receipt = receipt_json(&result)?;
                let (stored, _) = self.reverse_spend(&transaction, receipt, None).await?;
                Ok(stored)
            }
            ProviderOutcome::Indeterminate => self.park_reservation(transaction, Some(result)).await,
        }
    }

    /// Leave a reservation standing for reconciliation, recording the
    /// provider reference when the answer carried one.
    async fn park_reservation(
        &self,
        mut transaction: Transaction,
        result: Option<ProviderResult>,
    ) -> WalletResult<Transaction> {
        tracing::warn!(
            reference = %transaction.reference,
            transaction_id = %transaction.id,
            "Provider outcome unknown, reservation parked for reconciliation"
        );
        let provider_reference = match result.and_then(|r| r.provider_reference) {
            Some(reference) => reference,
            None => return Ok(transaction),
        };
        transaction.provider_reference = Some(provider_reference);
        transaction.updated_at = Utc::now();
        if !self
            .store
            .finalize_transaction(TransactionStatus::Reserved, &transaction)
            .await?
        {
            return self.stored_transaction(transaction.id).await;
        }
        Ok(transaction)
    }

    /// CAS a reserved spend to settled. Returns the stored transaction and
    /// whether this call performed the write.
    async fn settle_spend(
        &self,
        mut transaction: Transaction,
        result: ProviderResult,
    ) -> WalletResult<(Transaction, bool)> {
        transaction.provider_reference = result
            .provider_reference
            .clone()
            .or(transaction.provider_reference.take());
        transaction.receipt = Some(receipt_json(&result)?);
        transaction.transition(TransactionStatus::Settled)?;

        if self
            .store
            .finalize_transaction(TransactionStatus::Reserved, &transaction)
            .await?
        {
            tracing::info!(
                reference = %transaction.reference,
                transaction_id = %transaction.id,
                "Spend settled"
            );
            return Ok((transaction, true));
        }

        let stored = self.stored_transaction(transaction.id).await?;
        if stored.status == TransactionStatus::Reversed {
            tracing::error!(
                reference = %stored.reference,
                "Provider reports delivery but the spend is already reversed; manual review required"
            );
        }
        Ok((stored, false))
    }

    /// Compensating credit for a reserved spend. The credit entry and the
    /// status flip to reversed commit atomically; a status conflict means a
    /// rival finalizer won and their word stands.
    async fn reverse_spend(
        &self,
        transaction: &Transaction,
        receipt: serde_json::Value,
        reconciler_note: Option<&str>,
    ) -> WalletResult<(Transaction, bool)> {
        let mut reversed = transaction.clone();
        reversed.receipt = Some(receipt);
        if let Some(note) = reconciler_note {
            let mut context = OperationContext::reconciler().with_note(note);
            context.correlation_id = transaction.context.correlation_id;
            reversed.context = context;
        }
        reversed.transition(TransactionStatus::Reversed)?;

        let appended = self
            .ledger
            .append(
                transaction.account_id,
                EntryDirection::Credit,
                transaction.amount,
                &format!("reversal {}", transaction.reference),
                TransactionWrite::Update {
                    expected_status: TransactionStatus::Reserved,
                    transaction: reversed.clone(),
                },
            )
            .await;

        match appended {
            Ok(outcome) => {
                tracing::info!(
                    reference = %reversed.reference,
                    amount_kobo = transaction.amount.kobo(),
                    balance_kobo = outcome.new_balance.kobo(),
                    "Spend reversed, funds returned"
                );
                Ok((reversed, true))
            }
            Err(WalletError::Store(StoreError::StatusConflict { .. })) => {
                let stored = self.stored_transaction(transaction.id).await?;
                Ok((stored, false))
            }
            Err(err) => {
                tracing::warn!(
                    reference = %transaction.reference,
                    error = %err,
                    "Reversal did not land, reservation left for reconciliation"
                );
                Ok((transaction.clone(), false))
            }
        }
    }

    // -- top-ups --

    /// Record the intent to fund a wallet. No money moves here; the credit
    /// lands in [`confirm_topup`](Self::confirm_topup) once the provider
    /// verifies the payment.
    pub async fn initiate_topup(&self, command: TopUpCommand) -> WalletResult<CommandReceipt> {
        let amount = Amount::from_kobo(command.amount_kobo)?;
        let reference = match command.reference.as_deref().map(str::trim) {
            Some("") => {
                return Err(WalletError::InvalidRequest(
                    "reference must not be empty".to_string(),
                ))
            }
            Some(reference) => reference.to_string(),
            None => generate_reference("FUND"),
        };
        let fingerprint = IdempotencyGuard::fingerprint(
            command.account_id,
            TransactionKind::WalletFund,
            &amount,
        );

        let ticket = match self.guard.reserve(&reference, &fingerprint).await? {
            Reservation::Replay(stored) => {
                tracing::info!(reference = %reference, transaction_id = %stored.id, "Top-up replayed");
                return Ok(CommandReceipt::replay(stored));
            }
            Reservation::Fresh(ticket) => ticket,
        };

        if let Err(err) = self.active_account(command.account_id).await {
            self.release_quietly(&ticket).await;
            return Err(err);
        }

        let mut context = command.context.clone();
        context.ensure_correlation_id();

        let transaction = Transaction::new(
            command.account_id,
            TransactionKind::WalletFund,
            &reference,
            amount,
            command.details.clone(),
            context,
        );

        match self.store.insert_transaction(&transaction).await {
            Ok(()) => {}
            Err(StoreError::DuplicateReference(_)) => {
                return self.replay_committed_reference(&ticket, &fingerprint).await;
            }
            Err(err) => return Err(err.into()),
        }

        self.bind_quietly(&ticket, transaction.id).await;
        tracing::info!(
            account_id = %command.account_id,
            reference = %reference,
            amount_kobo = amount.kobo(),
            "Top-up recorded, awaiting provider confirmation"
        );
        Ok(CommandReceipt::fresh(transaction))
    }

    /// Verify a pending top-up with the provider and credit the wallet.
    ///
    /// The credited figure is the provider-verified amount, never the
    /// caller's claim. Confirming a settled or reversed top-up is a read.
    pub async fn confirm_topup(&self, command: ConfirmTopUpCommand) -> WalletResult<CommandReceipt> {
        let transaction = match self.pending_topup(&command.reference).await? {
            TopUpLookup::Terminal(stored) => return Ok(CommandReceipt::replay(stored)),
            TopUpLookup::Pending(transaction) => transaction,
        };

        let answer = tokio::time::timeout(
            self.provider_timeout,
            self.provider.requery(&command.reference),
        );
        let result = match answer.await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(reference = %command.reference, error = %err, "Payment verification failed");
                return Err(WalletError::ProviderIndeterminate(command.reference));
            }
            Err(_) => {
                tracing::warn!(reference = %command.reference, "Payment verification timed out");
                return Err(WalletError::ProviderIndeterminate(command.reference));
            }
        };

        match result.outcome {
            ProviderOutcome::Success => {
                let (stored, performed) = self.credit_confirmed_topup(transaction, result).await?;
                Ok(if performed {
                    CommandReceipt::fresh(stored)
                } else {
                    CommandReceipt::replay(stored)
                })
            }
            ProviderOutcome::Failure => {
                let message = result.message.clone();
                let receipt = receipt_json(&result)?;
                let (stored, _) = self.void_pending_topup(transaction, receipt).await?;
                match stored.status {
                    // A rival confirm saw success and credited; its answer
                    // wins over our failed requery.
                    TransactionStatus::Settled => Ok(CommandReceipt::replay(stored)),
                    _ => Err(WalletError::ProviderFailure {
                        reference: command.reference,
                        message,
                    }),
                }
            }
            ProviderOutcome::Indeterminate => {
                Err(WalletError::ProviderIndeterminate(command.reference))
            }
        }
    }

    /// Mark a pending top-up as failed. Ledger-neutral: nothing was ever
    /// credited, so nothing moves.
    pub async fn fail_topup(&self, command: FailTopUpCommand) -> WalletResult<CommandReceipt> {
        let transaction = match self.pending_topup(&command.reference).await? {
            TopUpLookup::Terminal(stored) => return Ok(CommandReceipt::replay(stored)),
            TopUpLookup::Pending(transaction) => transaction,
        };

        let receipt = serde_json::json!({
            "failed": true,
            "reason": command.reason,
            "reported_by": command.context.initiator,
        });

        let (stored, performed) = self.void_pending_topup(transaction, receipt).await?;
        Ok(if performed {
            CommandReceipt::fresh(stored)
        } else {
            CommandReceipt::replay(stored)
        })
    }

    async fn pending_topup(&self, reference: &str) -> WalletResult<TopUpLookup> {
        let transaction = self
            .store
            .fetch_transaction_by_reference(reference)
            .await?
            .ok_or_else(|| WalletError::ReferenceNotFound(reference.to_string()))?;

        if !transaction.kind.is_topup() {
            return Err(WalletError::InvalidRequest(format!(
                "{reference} is not a top-up reference"
            )));
        }

        if transaction.is_terminal() {
            return Ok(TopUpLookup::Terminal(transaction));
        }
        Ok(TopUpLookup::Pending(transaction))
    }

    /// Credit a verified top-up. The entry and the status flip commit
    /// atomically under a pending-status guard, so two confirms can never
    /// both credit.
    async fn credit_confirmed_topup(
        &self,
        transaction: Transaction,
        result: ProviderResult,
    ) -> WalletResult<(Transaction, bool)> {
        let requested = transaction.amount;
        let verified = result.verified_amount.unwrap_or(requested);
        if verified != requested {
            tracing::warn!(
                reference = %transaction.reference,
                requested_kobo = requested.kobo(),
                verified_kobo = verified.kobo(),
                "Provider verified a different amount; crediting the verified figure"
            );
        }

        let mut settled = transaction.clone();
        settled.amount = verified;
        settled.provider_reference = result
            .provider_reference
            .clone()
            .or(settled.provider_reference.take());
        settled.receipt = Some(serde_json::json!({
            "provider": receipt_json(&result)?,
            "requested_kobo": requested.kobo(),
        }));
        settled.transition(TransactionStatus::Settled)?;

        let appended = self
            .ledger
            .append(
                transaction.account_id,
                EntryDirection::Credit,
                verified,
                &format!("wallet fund {}", transaction.reference),
                TransactionWrite::Update {
                    expected_status: TransactionStatus::Pending,
                    transaction: settled.clone(),
                },
            )
            .await;

        match appended {
            Ok(outcome) => {
                tracing::info!(
                    reference = %settled.reference,
                    amount_kobo = verified.kobo(),
                    balance_kobo = outcome.new_balance.kobo(),
                    "Top-up settled"
                );
                Ok((settled, true))
            }
            Err(WalletError::Store(StoreError::StatusConflict { .. })) => {
                let stored = self.stored_transaction(transaction.id).await?;
                Ok((stored, false))
            }
            Err(err) => Err(err),
        }
    }

    async fn void_pending_topup(
        &self,
        transaction: Transaction,
        receipt: serde_json::Value,
    ) -> WalletResult<(Transaction, bool)> {
        let mut reversed = transaction.clone();
        reversed.receipt = Some(receipt);
        reversed.transition(TransactionStatus::Reversed)?;

        if self
            .store
            .finalize_transaction(TransactionStatus::Pending, &reversed)
            .await?
        {
            tracing::info!(reference = %reversed.reference, "Top-up voided, nothing credited");
            return Ok((reversed, true));
        }
        let stored = self.stored_transaction(transaction.id).await?;
        Ok((stored, false))
    }

    // -- reconciliation --

    /// Resolve one stuck transaction against the provider.
    ///
    /// Reserved spends settle or reverse according to the requery answer;
    /// pending top-ups likewise. When no answer arrives before the
    /// transaction is `force_reverse_after` old, funds are returned by
    /// force and the case logged for manual review.
    pub async fn reconcile_transaction(
        &self,
        transaction_id: Uuid,
        force_reverse_after: chrono::Duration,
    ) -> WalletResult<ReconcileAction> {
        let transaction = self.stored_transaction(transaction_id).await?;
        if transaction.is_terminal() {
            return Ok(ReconcileAction::AlreadyFinal);
        }

        let answer = tokio::time::timeout(
            self.provider_timeout,
            self.provider.requery(&transaction.reference),
        );
        let answer = match answer.await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(err)) => {
                tracing::warn!(reference = %transaction.reference, error = %err, "Requery failed");
                None
            }
            Err(_) => {
                tracing::warn!(reference = %transaction.reference, "Requery timed out");
                None
            }
        };

        let is_spend = transaction.kind.is_spend();

        match answer {
            Some(result) if result.outcome == ProviderOutcome::Success => {
                let (stored, performed) = if is_spend {
                    self.settle_spend(transaction, result).await?
                } else {
                    self.credit_confirmed_topup(transaction, result).await?
                };
                Ok(if performed {
                    ReconcileAction::Settled(stored)
                } else {
                    ReconcileAction::AlreadyFinal
                })
            }
            Some(result) if result.outcome == ProviderOutcome::Failure => {
                let receipt = receipt_json(&result)?;
                let (stored, performed) = if is_spend {
                    self.reverse_spend(
                        &transaction,
                        receipt,
                        Some("provider requery reported failure"),
                    )
                    .await?
                } else {
                    self.void_pending_topup(transaction, receipt).await?
                };
                Ok(reversal_action(stored, performed, false))
            }
            _ => {
                let age = Utc::now() - transaction.created_at;
                if age < force_reverse_after {
                    return Ok(ReconcileAction::LeftParked);
                }
                tracing::warn!(
                    reference = %transaction.reference,
                    age_minutes = age.num_minutes(),
                    "Requery window expired, force-reversing"
                );
                let receipt = serde_json::json!({
                    "forced": true,
                    "reason": "no provider answer within the requery window",
                });
                let (stored, performed) = if is_spend {
                    self.reverse_spend(
                        &transaction,
                        receipt,
                        Some("forced reversal, requery window expired"),
                    )
                    .await?
                } else {
                    self.void_pending_topup(transaction, receipt).await?
                };
                Ok(reversal_action(stored, performed, true))
            }
        }
    }

    // -- plumbing --

    async fn stored_transaction(&self, transaction_id: Uuid) -> WalletResult<Transaction> {
        self.store
            .fetch_transaction(transaction_id)
            .await?
            .ok_or(WalletError::TransactionNotFound(transaction_id))
    }

    async fn bind_quietly(&self, ticket: &ClaimTicket, transaction_id: Uuid) {
        if let Err(err) = self.guard.bind(ticket, transaction_id).await {
            tracing::warn!(
                reference = %ticket.reference(),
                error = %err,
                "Claim bind failed; transaction row remains authoritative"
            );
        }
    }

    async fn release_quietly(&self, ticket: &ClaimTicket) {
        if let Err(err) = self.guard.release(ticket).await {
            tracing::warn!(
                reference = %ticket.reference(),
                error = %err,
                "Claim release failed"
            );
        }
    }
}

enum TopUpLookup {
    Pending(Transaction),
    Terminal(Transaction),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Initiator;
    use crate::provider::{MockProvider, Script};
    use crate::store::MemoryStore;

    fn engine_with(provider: MockProvider) -> (TransactionEngine, Arc<MockProvider>) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let engine = TransactionEngine::new(
            store as Arc<dyn WalletStore>,
            Arc::clone(&provider) as Arc<dyn ProviderGateway>,
            &WalletConfig::for_tests(),
        );
        (engine, provider)
    }

    async fn funded_account(
        engine: &TransactionEngine,
        provider: &MockProvider,
        kobo: i64,
    ) -> Account {
        let account = engine.open_account("holder").await.unwrap();
        let receipt = engine
            .initiate_topup(TopUpCommand::new(account.id, kobo))
            .await
            .unwrap();
        let reference = receipt.transaction.reference.clone();
        provider.script_requery(&reference, Script::Success).await;
        engine
            .confirm_topup(ConfirmTopUpCommand::new(&reference))
            .await
            .unwrap();
        engine.account(account.id).await.unwrap()
    }

    /// Credit an account straight through the ledger, bypassing the
    /// provider. For tests whose provider is deliberately unusable.
    async fn seed_balance(engine: &TransactionEngine, account_id: Uuid, kobo: i64) {
        let amount = Amount::from_kobo(kobo).unwrap();
        let mut transaction = Transaction::new(
            account_id,
            TransactionKind::WalletFund,
            generate_reference("SEED"),
            amount,
            serde_json::json!({}),
            OperationContext::new(),
        );
        transaction.transition(TransactionStatus::Settled).unwrap();
        engine
            .ledger()
            .append(
                account_id,
                EntryDirection::Credit,
                amount,
                "seed",
                TransactionWrite::Insert(transaction),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spend_settles_and_debits() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;

        let receipt = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                30_000,
                "TX_1",
            ))
            .await
            .unwrap();

        assert!(!receipt.replayed);
        assert_eq!(receipt.transaction.status, TransactionStatus::Settled);
        assert!(receipt.transaction.receipt.is_some());
        assert!(receipt.transaction.provider_reference.is_some());

        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 70_000);
        let page = engine.history(account.id, None, 10).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].direction, EntryDirection::Debit);
        assert_eq!(provider.execute_calls("TX_1").await, 1);
    }

    #[tokio::test]
    async fn test_spend_replay_skips_the_provider() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;

        let command = SpendCommand::new(account.id, TransactionKind::Data, 25_000, "TX_dup");
        let first = engine.initiate_spend(command.clone()).await.unwrap();
        let second = engine.initiate_spend(command).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.transaction.id, second.transaction.id);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 75_000);
        assert_eq!(provider.execute_calls("TX_dup").await, 1);
    }

    #[tokio::test]
    async fn test_spend_provider_failure_refunds() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;
        provider
            .script_execute("TX_fail", Script::Failure("no airtime today".into()))
            .await;

        let receipt = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                30_000,
                "TX_fail",
            ))
            .await
            .unwrap();

        assert_eq!(receipt.transaction.status, TransactionStatus::Reversed);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 100_000);

        // Fund credit, spend debit, reversal credit.
        let page = engine.history(account.id, None, 10).await.unwrap();
        assert_eq!(page.entries.len(), 3);
        assert_eq!(page.entries[0].direction, EntryDirection::Credit);

        let report = engine.verify_conservation(account.id).await.unwrap();
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace_and_frees_the_reference() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 10_000).await;

        let err = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Bill,
                50_000,
                "TX_big",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));

        // No transaction row was created.
        assert!(matches!(
            engine.transaction_by_reference("TX_big").await.unwrap_err(),
            WalletError::ReferenceNotFound(_)
        ));

        // Fund the wallet, then the very same reference goes through.
        engine
            .initiate_topup(TopUpCommand::new(account.id, 90_000).with_reference("FUND_more"))
            .await
            .unwrap();
        provider.script_requery("FUND_more", Script::Success).await;
        engine
            .confirm_topup(ConfirmTopUpCommand::new("FUND_more"))
            .await
            .unwrap();

        let receipt = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Bill,
                50_000,
                "TX_big",
            ))
            .await
            .unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.transaction.status, TransactionStatus::Settled);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 50_000);
    }

    #[tokio::test]
    async fn test_reference_reuse_with_different_params_is_refused() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;

        engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                30_000,
                "TX_1",
            ))
            .await
            .unwrap();

        let err = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                50_000,
                "TX_1",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ReferenceReuse(_)));
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 70_000);
    }

    #[tokio::test]
    async fn test_disabled_account_refuses_new_intents() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;
        engine.disable_account(account.id).await.unwrap();

        let err = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                10_000,
                "TX_1",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::AccountDisabled(_)));

        let err = engine
            .initiate_topup(TopUpCommand::new(account.id, 10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::AccountDisabled(_)));

        engine.enable_account(account.id).await.unwrap();
        engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                10_000,
                "TX_1",
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_topup_credits_the_verified_amount() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = engine.open_account("holder").await.unwrap();

        let receipt = engine
            .initiate_topup(
                TopUpCommand::new(account.id, 100_000).with_reference("FUND_pay"),
            )
            .await
            .unwrap();
        assert_eq!(receipt.transaction.status, TransactionStatus::Pending);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 0);

        // The provider saw 50,000 kobo, not the claimed 100,000.
        provider
            .script_requery("FUND_pay", Script::SuccessWithAmount(50_000))
            .await;
        let confirmed = engine
            .confirm_topup(ConfirmTopUpCommand::new("FUND_pay"))
            .await
            .unwrap();

        assert_eq!(confirmed.transaction.status, TransactionStatus::Settled);
        assert_eq!(confirmed.transaction.amount.kobo(), 50_000);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 50_000);

        let stored_receipt = confirmed.transaction.receipt.unwrap();
        assert_eq!(stored_receipt["requested_kobo"], 100_000);
    }

    #[tokio::test]
    async fn test_topup_retry_replays_after_amount_adjustment() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = engine.open_account("holder").await.unwrap();

        let command = TopUpCommand::new(account.id, 100_000).with_reference("FUND_adj");
        engine.initiate_topup(command.clone()).await.unwrap();

        provider
            .script_requery("FUND_adj", Script::SuccessWithAmount(50_000))
            .await;
        engine
            .confirm_topup(ConfirmTopUpCommand::new("FUND_adj"))
            .await
            .unwrap();
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 50_000);

        // Settlement replaced the amount with the verified 50,000, but an
        // identical retry of the original request still replays.
        let retry = engine.initiate_topup(command).await.unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.transaction.status, TransactionStatus::Settled);
        assert_eq!(retry.transaction.amount.kobo(), 50_000);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 50_000);

        // A genuinely different amount on the same reference is still reuse.
        let err = engine
            .initiate_topup(TopUpCommand::new(account.id, 75_000).with_reference("FUND_adj"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ReferenceReuse(_)));
    }

    #[tokio::test]
    async fn test_confirm_topup_twice_credits_once() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = engine.open_account("holder").await.unwrap();

        engine
            .initiate_topup(TopUpCommand::new(account.id, 40_000).with_reference("FUND_1"))
            .await
            .unwrap();
        provider.script_requery("FUND_1", Script::Success).await;

        let first = engine
            .confirm_topup(ConfirmTopUpCommand::new("FUND_1"))
            .await
            .unwrap();
        let second = engine
            .confirm_topup(ConfirmTopUpCommand::new("FUND_1"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 40_000);
        let page = engine.history(account.id, None, 10).await.unwrap();
        assert_eq!(page.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_payment_voids_the_topup() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = engine.open_account("holder").await.unwrap();

        engine
            .initiate_topup(TopUpCommand::new(account.id, 40_000).with_reference("FUND_bad"))
            .await
            .unwrap();
        provider
            .script_requery("FUND_bad", Script::Failure("card declined".into()))
            .await;

        let err = engine
            .confirm_topup(ConfirmTopUpCommand::new("FUND_bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ProviderFailure { .. }));

        let stored = engine.transaction_by_reference("FUND_bad").await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Reversed);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 0);
    }

    #[tokio::test]
    async fn test_fail_topup_is_ledger_neutral() {
        let (engine, _provider) = engine_with(MockProvider::new());
        let account = engine.open_account("holder").await.unwrap();

        engine
            .initiate_topup(TopUpCommand::new(account.id, 40_000).with_reference("FUND_1"))
            .await
            .unwrap();

        let receipt = engine
            .fail_topup(FailTopUpCommand::new("FUND_1", "payment page abandoned"))
            .await
            .unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.transaction.status, TransactionStatus::Reversed);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 0);
        let page = engine.history(account.id, None, 10).await.unwrap();
        assert!(page.entries.is_empty());

        // Marking it failed again is a read.
        let again = engine
            .fail_topup(FailTopUpCommand::new("FUND_1", "double report"))
            .await
            .unwrap();
        assert!(again.replayed);
    }

    #[tokio::test]
    async fn test_indeterminate_spend_parks_then_reconciles_to_settled() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;
        provider.script_execute("TX_slow", Script::Indeterminate).await;

        let receipt = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Data,
                30_000,
                "TX_slow",
            ))
            .await
            .unwrap();

        // Funds stay held while the outcome is unknown.
        assert_eq!(receipt.transaction.status, TransactionStatus::Reserved);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 70_000);

        provider.script_requery("TX_slow", Script::Success).await;
        let action = engine
            .reconcile_transaction(receipt.transaction.id, chrono::Duration::hours(24))
            .await
            .unwrap();

        let settled = match action {
            ReconcileAction::Settled(stored) => stored,
            other => panic!("expected settled, got {other:?}"),
        };
        assert_eq!(settled.status, TransactionStatus::Settled);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 70_000);
        assert_eq!(provider.execute_calls("TX_slow").await, 1);
        assert_eq!(provider.requery_calls("TX_slow").await, 1);
    }

    #[tokio::test]
    async fn test_forced_reversal_after_the_requery_window() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;
        provider.script_execute("TX_lost", Script::Indeterminate).await;
        provider.script_requery("TX_lost", Script::Indeterminate).await;

        let receipt = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Bill,
                30_000,
                "TX_lost",
            ))
            .await
            .unwrap();
        assert_eq!(receipt.transaction.status, TransactionStatus::Reserved);

        let action = engine
            .reconcile_transaction(receipt.transaction.id, chrono::Duration::zero())
            .await
            .unwrap();

        let reversed = match action {
            ReconcileAction::ForcedReversal(stored) => stored,
            other => panic!("expected forced reversal, got {other:?}"),
        };
        assert_eq!(reversed.status, TransactionStatus::Reversed);
        assert_eq!(reversed.context.initiator, Initiator::Reconciler);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 100_000);

        let report = engine.verify_conservation(account.id).await.unwrap();
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_reconcile_leaves_young_indeterminate_reservations() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;
        provider.script_execute("TX_wait", Script::Indeterminate).await;
        provider.script_requery("TX_wait", Script::Indeterminate).await;

        let receipt = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                10_000,
                "TX_wait",
            ))
            .await
            .unwrap();

        let action = engine
            .reconcile_transaction(receipt.transaction.id, chrono::Duration::hours(24))
            .await
            .unwrap();
        assert!(matches!(action, ReconcileAction::LeftParked));
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 90_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_parks_the_reservation() {
        // Latency far past the 5s call budget: the execute is abandoned
        // and the debit stays held for reconciliation.
        let (engine, _provider) =
            engine_with(MockProvider::new().with_latency(Duration::from_secs(60)));
        let account = engine.open_account("holder").await.unwrap();
        seed_balance(&engine, account.id, 100_000).await;

        let receipt = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                30_000,
                "TX_slow_wire",
            ))
            .await
            .unwrap();

        assert!(!receipt.replayed);
        assert_eq!(receipt.transaction.status, TransactionStatus::Reserved);
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 70_000);

        let stored = engine.transaction_by_reference("TX_slow_wire").await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Reserved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payment_verification_timeout_is_indeterminate() {
        let (engine, _provider) =
            engine_with(MockProvider::new().with_latency(Duration::from_secs(60)));
        let account = engine.open_account("holder").await.unwrap();

        engine
            .initiate_topup(TopUpCommand::new(account.id, 40_000).with_reference("FUND_slow"))
            .await
            .unwrap();

        let err = engine
            .confirm_topup(ConfirmTopUpCommand::new("FUND_slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ProviderIndeterminate(_)));

        // Nothing credited; the intent is still open for a later confirm.
        assert_eq!(engine.balance(account.id).await.unwrap().kobo(), 0);
        let stored = engine.transaction_by_reference("FUND_slow").await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_wrong_kind_routing_is_refused() {
        let (engine, provider) = engine_with(MockProvider::new());
        let account = funded_account(&engine, &provider, 100_000).await;

        let err = engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::WalletFund,
                10_000,
                "TX_1",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidRequest(_)));

        engine
            .initiate_spend(SpendCommand::new(
                account.id,
                TransactionKind::Airtime,
                10_000,
                "TX_air",
            ))
            .await
            .unwrap();
        let err = engine
            .confirm_topup(ConfirmTopUpCommand::new("TX_air"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidRequest(_)));
    }
}
