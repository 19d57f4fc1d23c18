//! Common test utilities

use std::sync::Arc;

use uuid::Uuid;

use kobo_ledger::config::WalletConfig;
use kobo_ledger::engine::{ConfirmTopUpCommand, TopUpCommand, TransactionEngine};
use kobo_ledger::provider::{MockProvider, Script};
use kobo_ledger::store::MemoryStore;

/// Engine over the in-memory store with a scriptable provider.
pub fn memory_engine() -> (TransactionEngine, Arc<MockProvider>) {
    memory_engine_with(MockProvider::new())
}

/// Same, but over a caller-configured provider (latency, success rate).
pub fn memory_engine_with(provider: MockProvider) -> (TransactionEngine, Arc<MockProvider>) {
    let provider = Arc::new(provider);
    let engine = TransactionEngine::new(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        &WalletConfig::for_tests(),
    );
    (engine, provider)
}

/// Open an account and fund it through a confirmed top-up.
pub async fn funded_account(
    engine: &TransactionEngine,
    provider: &MockProvider,
    kobo: i64,
) -> Uuid {
    let account = engine
        .open_account("integration holder")
        .await
        .expect("open account");

    let reference = format!("SEED_{}", Uuid::new_v4().simple());
    engine
        .initiate_topup(TopUpCommand::new(account.id, kobo).with_reference(&reference))
        .await
        .expect("initiate top-up");
    provider.script_requery(&reference, Script::Success).await;
    engine
        .confirm_topup(ConfirmTopUpCommand::new(&reference))
        .await
        .expect("confirm top-up");

    account.id
}
