//! Scheduled jobs
//!
//! Background passes that keep the ledger honest: stuck transactions are
//! re-driven against the provider until they settle or reverse, and
//! reference claims past their TTL are swept out.

use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;

use crate::config::WalletConfig;
use crate::domain::TransactionStatus;
use crate::engine::{ReconcileAction, TransactionEngine};
use crate::error::WalletError;

// =========================================================================
// Reconciliation pass
// =========================================================================

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileTally {
    pub examined: u64,
    pub settled: u64,
    pub reversed: u64,
    pub forced: u64,
    pub left_parked: u64,
    pub already_final: u64,
}

/// Resolve transactions stuck in a non-terminal status.
///
/// Scans reserved spends and pending top-ups that have sat untouched for
/// longer than `stuck_after`, requeries the provider for each and applies
/// the answer. One failing transaction never stops the pass.
pub async fn reconcile_stuck_transactions(
    engine: &TransactionEngine,
    config: &JobSchedulerConfig,
) -> Result<ReconcileTally, JobError> {
    let cutoff = Utc::now() - config.stuck_after;
    let mut tally = ReconcileTally::default();

    for status in [TransactionStatus::Reserved, TransactionStatus::Pending] {
        let stuck = engine
            .store()
            .transactions_in_status_since(status, cutoff, config.batch_size)
            .await
            .map_err(WalletError::from)?;

        for transaction in stuck {
            tally.examined += 1;
            match engine
                .reconcile_transaction(transaction.id, config.force_reverse_after)
                .await
            {
                Ok(ReconcileAction::Settled(_)) => tally.settled += 1,
                Ok(ReconcileAction::Reversed(_)) => tally.reversed += 1,
                Ok(ReconcileAction::ForcedReversal(_)) => tally.forced += 1,
                Ok(ReconcileAction::LeftParked) => tally.left_parked += 1,
                Ok(ReconcileAction::AlreadyFinal) => tally.already_final += 1,
                Err(e) => {
                    tracing::error!(
                        transaction_id = %transaction.id,
                        reference = %transaction.reference,
                        error = %e,
                        "Reconciliation of one transaction failed"
                    );
                }
            }
        }
    }

    if tally.examined > 0 {
        tracing::info!(
            examined = tally.examined,
            settled = tally.settled,
            reversed = tally.reversed,
            forced = tally.forced,
            left_parked = tally.left_parked,
            "Reconciliation pass finished"
        );
    }

    Ok(tally)
}

// =========================================================================
// Claim sweeping
// =========================================================================

/// Delete reference claims whose TTL has passed.
///
/// Committed references stay protected by the transactions table; only the
/// claim rows go.
pub async fn sweep_expired_claims(engine: &TransactionEngine) -> Result<u64, JobError> {
    let swept = engine.guard().sweep_expired().await?;

    if swept > 0 {
        tracing::info!(swept = swept, "Swept expired reference claims");
    }

    Ok(swept)
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for the job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// How often the reconciliation pass runs (default: 2 minutes)
    pub reconcile_interval: Duration,

    /// How often expired claims are swept (default: 10 minutes)
    pub claim_sweep_interval: Duration,

    /// How many stuck transactions one pass will touch per status
    pub batch_size: i64,

    /// How long a transaction must sit untouched before reconciliation
    /// picks it up, so the pass never races the hot path
    pub stuck_after: chrono::Duration,

    /// Age past which a still-indeterminate transaction is force-reversed
    pub force_reverse_after: chrono::Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(120),
            claim_sweep_interval: Duration::from_secs(600),
            batch_size: 50,
            stuck_after: chrono::Duration::minutes(5),
            force_reverse_after: chrono::Duration::hours(24),
        }
    }
}

impl JobSchedulerConfig {
    /// Derive scheduler settings from the application configuration.
    pub fn from_wallet_config(config: &WalletConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
            batch_size: config.reconcile_batch_size,
            stuck_after: chrono::Duration::seconds((config.provider_timeout_seconds * 2) as i64),
            force_reverse_after: config.force_reverse_after(),
            ..Self::default()
        }
    }
}

/// Job scheduler - runs the periodic maintenance passes
pub struct JobScheduler {
    engine: TransactionEngine,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    /// Create a new job scheduler with default intervals
    pub fn new(engine: TransactionEngine) -> Self {
        Self {
            engine,
            config: JobSchedulerConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(engine: TransactionEngine, config: JobSchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the scheduler loop
    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut reconcile_interval = interval(self.config.reconcile_interval);
        let mut sweep_interval = interval(self.config.claim_sweep_interval);

        loop {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    if let Err(e) = reconcile_stuck_transactions(&self.engine, &self.config).await {
                        tracing::error!(error = %e, "Reconciliation pass failed");
                    }
                }
                _ = sweep_interval.tick() => {
                    if let Err(e) = sweep_expired_claims(&self.engine).await {
                        tracing::error!(error = %e, "Claim sweep failed");
                    }
                }
            }
        }
    }

    /// Run all maintenance passes once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match reconcile_stuck_transactions(&self.engine, &self.config).await {
            Ok(tally) => report.reconciled = tally,
            Err(e) => report.errors.push(format!("Reconciliation: {}", e)),
        }

        match sweep_expired_claims(&self.engine).await {
            Ok(count) => report.claims_swept = count,
            Err(e) => report.errors.push(format!("Claim sweep: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance passes
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub reconciled: ReconcileTally,
    pub claims_swept: u64,
    pub errors: Vec<String>,
    pub completed_at: chrono::DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Engine error: {0}")]
    Engine(#[from] WalletError),
}

// =========================================================================
// Tests
// =========================================================================
