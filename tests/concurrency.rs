//! Concurrency tests: per-account serialization under rival writers.

use std::time::Duration;

use kobo_ledger::domain::{Transaction, TransactionKind, TransactionStatus};
use kobo_ledger::engine::{CommandReceipt, SpendCommand, TransactionEngine};
use kobo_ledger::error::WalletError;
use kobo_ledger::provider::{MockProvider, Script};

mod common;

/// Drive one spend to a definitive outcome. Contention and in-flight
/// signals are retryable; a real caller re-submits them the same way.
async fn spend_until_settled(
    engine: &TransactionEngine,
    command: SpendCommand,
) -> Result<CommandReceipt, WalletError> {
    for _ in 0..25 {
        match engine.initiate_spend(command.clone()).await {
            Err(WalletError::Contention(_)) | Err(WalletError::ReferenceInFlight(_)) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            definitive => return definitive,
        }
    }
    panic!("spend {} never reached a definitive outcome", command.reference);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spends_never_overdraw() {
    let (engine, provider) = common::memory_engine();
    let account_id = common::funded_account(&engine, &provider, 50_000).await;

    // Ten rival spends of 10k against a 50k balance: exactly five can fit.
    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            spend_until_settled(
                &engine,
                SpendCommand::new(
                    account_id,
                    TransactionKind::Airtime,
                    10_000,
                    format!("RACE_{i}"),
                ),
            )
            .await
        }));
    }

    let mut settled = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => {
                assert_eq!(receipt.transaction.status, TransactionStatus::Settled);
                settled += 1;
            }
            Err(WalletError::InsufficientFunds { .. }) => refused += 1,
            Err(other) => panic!("unexpected outcome: {other}"),
        }
    }

    assert_eq!(settled, 5, "only five spends fit the balance");
    assert_eq!(refused, 5);
    assert_eq!(engine.balance(account_id).await.unwrap().kobo(), 0);

    let report = engine.verify_conservation(account_id).await.unwrap();
    assert!(report.is_consistent(), "breaks: {:?}", report.breaks);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rival_callers_one_reference_execute_once() {
    let (engine, provider) = common::memory_engine();
    let account_id = common::funded_account(&engine, &provider, 40_000).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            spend_until_settled(
                &engine,
                SpendCommand::new(account_id, TransactionKind::Data, 10_000, "DUP_RACE"),
            )
            .await
        }));
    }

    let mut performed = 0;
    let mut replayed = 0;
    for handle in handles {
        let receipt = handle.await.unwrap().unwrap();
        if receipt.replayed {
            replayed += 1;
        } else {
            performed += 1;
        }
    }

    // One caller did the work; everyone else got its transaction back.
    assert_eq!(performed, 1);
    assert_eq!(replayed, 7);
    assert_eq!(provider.execute_calls("DUP_RACE").await, 1);
    assert_eq!(engine.balance(account_id).await.unwrap().kobo(), 30_000);

    let stored = engine.transaction_by_reference("DUP_RACE").await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Settled);
}

/// Poll until a reference reaches a terminal status. Settlement runs on
/// its own task, so the result arrives on its own schedule.
async fn wait_for_terminal(engine: &TransactionEngine, reference: &str) -> Transaction {
    for _ in 0..200 {
        if let Ok(stored) = engine.transaction_by_reference(reference).await {
            if stored.is_terminal() {
                return stored;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{reference} never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_caller_spend_still_settles() {
    let (engine, provider) = common::memory_engine_with(
        MockProvider::new().with_latency(Duration::from_millis(300)),
    );
    let account_id = common::funded_account(&engine, &provider, 50_000).await;

    // The caller gives up while the provider is still delivering. Dropping
    // the await must not drop the settlement.
    let abandoned = tokio::select! {
        receipt = engine.initiate_spend(SpendCommand::new(
            account_id,
            TransactionKind::Airtime,
            30_000,
            "TX_walk_away",
        )) => Some(receipt),
        _ = tokio::time::sleep(Duration::from_millis(100)) => None,
    };
    assert!(abandoned.is_none(), "caller was expected to give up first");

    let stored = wait_for_terminal(&engine, "TX_walk_away").await;
    assert_eq!(stored.status, TransactionStatus::Settled);
    assert_eq!(engine.balance(account_id).await.unwrap().kobo(), 20_000);
    assert_eq!(provider.execute_calls("TX_walk_away").await, 1);

    let report = engine.verify_conservation(account_id).await.unwrap();
    assert!(report.is_consistent(), "breaks: {:?}", report.breaks);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aborted_caller_refund_still_lands() {
    let (engine, provider) = common::memory_engine_with(
        MockProvider::new().with_latency(Duration::from_millis(300)),
    );
    let account_id = common::funded_account(&engine, &provider, 50_000).await;
    provider
        .script_execute("TX_cut_off", Script::Failure("declined".to_string()))
        .await;

    let caller = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .initiate_spend(SpendCommand::new(
                    account_id,
                    TransactionKind::Data,
                    30_000,
                    "TX_cut_off",
                ))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    // The settlement task survives the abort and refunds the debit.
    let stored = wait_for_terminal(&engine, "TX_cut_off").await;
    assert_eq!(stored.status, TransactionStatus::Reversed);
    assert_eq!(engine.balance(account_id).await.unwrap().kobo(), 50_000);

    let report = engine.verify_conservation(account_id).await.unwrap();
    assert!(report.is_consistent(), "breaks: {:?}", report.breaks);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_accounts_settle_and_reverse_independently() {
    let (engine, provider) = common::memory_engine();

    let mut accounts = Vec::new();
    for _ in 0..4 {
        accounts.push(common::funded_account(&engine, &provider, 30_000).await);
    }

    // Per account: three spends, the middle one declined by the provider.
    let mut handles = Vec::new();
    for (index, account_id) in accounts.iter().copied().enumerate() {
        let engine = engine.clone();
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            for step in 0..3 {
                let reference = format!("MIX_{index}_{step}");
                if step == 1 {
                    provider
                        .script_execute(&reference, Script::Failure("declined".to_string()))
                        .await;
                }
                let receipt = engine
                    .initiate_spend(SpendCommand::new(
                        account_id,
                        TransactionKind::Bill,
                        10_000,
                        reference,
                    ))
                    .await
                    .unwrap();
                let expected = if step == 1 {
                    TransactionStatus::Reversed
                } else {
                    TransactionStatus::Settled
                };
                assert_eq!(receipt.transaction.status, expected);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for account_id in accounts {
        // 30k funded, 20k delivered, 10k refunded
        assert_eq!(engine.balance(account_id).await.unwrap().kobo(), 10_000);
        let page = engine.history(account_id, None, 10).await.unwrap();
        assert_eq!(page.entries.len(), 5, "seed + three debits + one reversal");
        let report = engine.verify_conservation(account_id).await.unwrap();
        assert!(report.is_consistent(), "breaks: {:?}", report.breaks);
    }
}
