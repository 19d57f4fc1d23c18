//! Soak drill for the wallet engine
//!
//! Run with: cargo run --bin soak --release -- --accounts 8 --spends 500
//!
//! Drives concurrent top-ups, spends and duplicate confirmations through
//! the engine over the in-memory store with a flaky mock provider, then
//! audits every account for conservation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use kobo_ledger::config::WalletConfig;
use kobo_ledger::domain::{TransactionKind, TransactionStatus};
use kobo_ledger::engine::{
    ConfirmTopUpCommand, SpendCommand, TopUpCommand, TransactionEngine,
};
use kobo_ledger::error::WalletError;
use kobo_ledger::provider::{MockProvider, Script};
use kobo_ledger::store::MemoryStore;

fn arg(args: &[String], name: &str, default: u64) -> u64 {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let account_count = arg(&args, "--accounts", 8);
    let spends_per_account = arg(&args, "--spends", 500);
    let seed_kobo: i64 = 10_000_000;

    println!(
        "Soak drill - {} accounts, {} spends each",
        account_count, spends_per_account
    );

    let provider = Arc::new(
        MockProvider::new()
            .with_latency(Duration::from_millis(1))
            .with_success_rate(0.9),
    );
    let engine = TransactionEngine::new(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        &WalletConfig::for_tests(),
    );

    let mut accounts = Vec::new();
    for i in 0..account_count {
        let account = engine.open_account(&format!("soak-{i}")).await?;
        let reference = format!("SEED_{i}");
        engine
            .initiate_topup(
                TopUpCommand::new(account.id, seed_kobo).with_reference(&reference),
            )
            .await?;
        provider.script_requery(&reference, Script::Success).await;
        // Duplicate confirmation on every account: the second must replay.
        let first = engine
            .confirm_topup(ConfirmTopUpCommand::new(&reference))
            .await?;
        let second = engine
            .confirm_topup(ConfirmTopUpCommand::new(&reference))
            .await?;
        anyhow::ensure!(!first.replayed && second.replayed, "confirm replay broke");
        accounts.push(account.id);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for (index, account_id) in accounts.iter().copied().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut settled = 0u64;
            let mut reversed = 0u64;
            let mut refused = 0u64;
            let mut replayed = 0u64;

            for op in 0..spends_per_account {
                let kobo = rand::thread_rng().gen_range(1_000i64..50_000);
                let reference = format!("SOAK_{index}_{op}");
                let command = SpendCommand::new(
                    account_id,
                    TransactionKind::Airtime,
                    kobo,
                    &reference,
                );

                match engine.initiate_spend(command.clone()).await {
                    Ok(receipt) => {
                        match receipt.transaction.status {
                            TransactionStatus::Settled => settled += 1,
                            TransactionStatus::Reversed => reversed += 1,
                            _ => {}
                        }
                        // Every tenth spend is retried as a client would.
                        if op % 10 == 0 {
                            let replay = engine
                                .initiate_spend(command)
                                .await
                                .expect("replay of a committed reference");
                            assert!(replay.replayed);
                            replayed += 1;
                        }
                    }
                    Err(WalletError::InsufficientFunds { .. }) => refused += 1,
                    Err(e) => panic!("unexpected soak failure: {e}"),
                }
            }

            (settled, reversed, refused, replayed)
        }));
    }

    let mut totals = (0u64, 0u64, 0u64, 0u64);
    for handle in handles {
        let (settled, reversed, refused, replayed) = handle.await?;
        totals.0 += settled;
        totals.1 += reversed;
        totals.2 += refused;
        totals.3 += replayed;
    }
    let elapsed = start.elapsed();

    println!("\n=== Soak Results ===");
    println!("Settled:  {}", totals.0);
    println!("Reversed: {}", totals.1);
    println!("Refused:  {}", totals.2);
    println!("Replayed: {}", totals.3);
    println!("Time: {:.2}s", elapsed.as_secs_f64());
    println!(
        "Rate: {:.0} spends/sec",
        (totals.0 + totals.1 + totals.2) as f64 / elapsed.as_secs_f64()
    );

    println!("\n=== Conservation Audit ===");
    let mut clean = true;
    for account_id in accounts {
        let report = engine.verify_conservation(account_id).await?;
        let balance = engine.balance(account_id).await?;
        if report.is_consistent() {
            println!(
                "{}: OK ({} entries, balance {})",
                account_id, report.entry_count, balance
            );
        } else {
            clean = false;
            println!("{}: BROKEN {:?}", account_id, report.breaks);
        }
    }

    anyhow::ensure!(clean, "conservation audit found breaks");
    println!("\nAll accounts conserve funds.");
    Ok(())
}
