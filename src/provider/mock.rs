//! Mock provider
//!
//! Scriptable stand-in for a real payment or fulfilment provider. Tests
//! queue per-reference answers; unscripted calls fall back to the latency
//! and success-rate dials. The mock remembers what it answered, so a later
//! requery agrees with the execute that preceded it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::Amount;

use super::{ProviderError, ProviderGateway, ProviderOutcome, ProviderRequest, ProviderResult};

/// One scripted answer, consumed in queue order.
#[derive(Debug, Clone)]
pub enum Script {
    /// Definitive success.
    Success,

    /// Definitive success reporting this processed amount in kobo.
    SuccessWithAmount(i64),

    /// Definitive refusal with this message.
    Failure(String),

    /// No definitive answer.
    Indeterminate,

    /// The call itself dies: the caller gets a transport error and cannot
    /// know whether the work happened.
    TransportError,
}

#[derive(Default)]
struct MockState {
    execute_scripts: HashMap<String, VecDeque<Script>>,
    requery_scripts: HashMap<String, VecDeque<Script>>,
    /// Definitive outcomes already given, by reference.
    settled: HashMap<String, (ProviderOutcome, Option<i64>)>,
    execute_calls: HashMap<String, u64>,
    requery_calls: HashMap<String, u64>,
}

/// Scriptable in-process provider.
pub struct MockProvider {
    latency: Duration,
    success_rate: f64,
    state: Arc<RwLock<MockState>>,
}

impl MockProvider {
    /// A provider that always succeeds instantly.
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            success_rate: 1.0,
            state: Arc::new(RwLock::new(MockState::default())),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Probability that an unscripted execute succeeds; the rest fail
    /// definitively.
    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate;
        self
    }

    /// Queue an answer for the next execute of `reference`.
    pub async fn script_execute(&self, reference: &str, script: Script) {
        self.state
            .write()
            .await
            .execute_scripts
            .entry(reference.to_string())
            .or_default()
            .push_back(script);
    }

    /// Queue an answer for the next requery of `reference`.
    pub async fn script_requery(&self, reference: &str, script: Script) {
        self.state
            .write()
            .await
            .requery_scripts
            .entry(reference.to_string())
            .or_default()
            .push_back(script);
    }

    /// How many times execute was called for `reference`.
    pub async fn execute_calls(&self, reference: &str) -> u64 {
        self.state
            .read()
            .await
            .execute_calls
            .get(reference)
            .copied()
            .unwrap_or(0)
    }

    /// How many times requery was called for `reference`.
    pub async fn requery_calls(&self, reference: &str) -> u64 {
        self.state
            .read()
            .await
            .requery_calls
            .get(reference)
            .copied()
            .unwrap_or(0)
    }

    fn roll_success(&self) -> bool {
        if self.success_rate >= 1.0 {
            return true;
        }
        let mut rng = rand::thread_rng();
        rng.gen::<f64>() <= self.success_rate
    }

    fn mock_reference() -> String {
        format!("MOCK-{}", Uuid::new_v4())
    }

    fn answer(
        script: Script,
        requested_amount: Option<Amount>,
    ) -> Result<ProviderResult, ProviderError> {
        match script {
            Script::Success => {
                let mut result = ProviderResult::success("fulfilled")
                    .with_provider_reference(Self::mock_reference())
                    .with_payload(serde_json::json!({
                        "status": "delivered",
                        "at": Utc::now().to_rfc3339(),
                    }));
                if let Some(amount) = requested_amount {
                    result = result.with_verified_amount(amount);
                }
                Ok(result)
            }
            Script::SuccessWithAmount(kobo) => {
                let amount = Amount::from_kobo(kobo).map_err(|e| {
                    ProviderError::Protocol(format!("scripted amount invalid: {e}"))
                })?;
                Ok(ProviderResult::success("fulfilled")
                    .with_provider_reference(Self::mock_reference())
                    .with_verified_amount(amount)
                    .with_payload(serde_json::json!({
                        "status": "delivered",
                        "amount_kobo": kobo,
                    })))
            }
            Script::Failure(message) => Ok(ProviderResult::failure(&message)
                .with_payload(serde_json::json!({ "status": "failed", "reason": message }))),
            Script::Indeterminate => Ok(ProviderResult::indeterminate("status pending")
                .with_payload(serde_json::json!({ "status": "pending" }))),
            Script::TransportError => {
                Err(ProviderError::Transport("connection reset".to_string()))
            }
        }
    }

    fn record(state: &mut MockState, reference: &str, answer: &Result<ProviderResult, ProviderError>) {
        if let Ok(result) = answer {
            match result.outcome {
                ProviderOutcome::Success | ProviderOutcome::Failure => {
                    state.settled.insert(
                        reference.to_string(),
                        (result.outcome, result.verified_amount.map(|a| a.kobo())),
                    );
                }
                ProviderOutcome::Indeterminate => {}
            }
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderGateway for MockProvider {
    async fn execute(&self, request: &ProviderRequest) -> Result<ProviderResult, ProviderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = {
            let mut state = self.state.write().await;
            *state
                .execute_calls
                .entry(request.reference.clone())
                .or_insert(0) += 1;
            state
                .execute_scripts
                .get_mut(&request.reference)
                .and_then(|queue| queue.pop_front())
        };

        let script = match scripted {
            Some(script) => script,
            None if self.roll_success() => Script::Success,
            None => Script::Failure("Simulated provider decline".to_string()),
        };

        let answer = Self::answer(script, Some(request.amount));
        Self::record(&mut *self.state.write().await, &request.reference, &answer);
        answer
    }

    async fn requery(&self, reference: &str) -> Result<ProviderResult, ProviderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency / 2).await;
        }

        let (scripted, settled) = {
            let mut state = self.state.write().await;
            *state
                .requery_calls
                .entry(reference.to_string())
                .or_insert(0) += 1;
            let scripted = state
                .requery_scripts
                .get_mut(reference)
                .and_then(|queue| queue.pop_front());
            (scripted, state.settled.get(reference).copied())
        };

        if let Some(script) = scripted {
            let answer = Self::answer(script, None);
            Self::record(&mut *self.state.write().await, reference, &answer);
            return answer;
        }

        match settled {
            Some((ProviderOutcome::Success, amount_kobo)) => {
                let mut result = ProviderResult::success("fulfilled")
                    .with_payload(serde_json::json!({ "status": "delivered" }));
                if let Some(kobo) = amount_kobo {
                    let amount = Amount::from_kobo(kobo).map_err(|e| {
                        ProviderError::Protocol(format!("recorded amount invalid: {e}"))
                    })?;
                    result = result.with_verified_amount(amount);
                }
                Ok(result)
            }
            Some((ProviderOutcome::Failure, _)) => Ok(ProviderResult::failure("failed")
                .with_payload(serde_json::json!({ "status": "failed" }))),
            // A reference the provider never settled and has no script for:
            // the work never reached it.
            _ => Ok(ProviderResult::failure("reference unknown to provider")
                .with_payload(serde_json::json!({ "status": "unknown" }))),
        }
    }
}
