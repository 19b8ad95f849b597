//! Shared fixtures for coordinator integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use saga_coordinator::{
    Compensation, CoordinatorConfig, Direction, InMemorySagaStore, InvokerRegistry,
    SagaCoordinator, SagaDefinition, StepError, StepErrorCode, StepInvoker, StepRequest,
    Transaction,
};
use serde_json::{json, Value};
use uuid::Uuid;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// One observed remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub step_id: String,
    pub transaction_id: String,
    pub direction: Direction,
    pub attempt: u32,
    pub idempotency_key: Uuid,
    pub input: Value,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Always,
    Recoverable { remaining: u32 },
}

/// Invoker that records every call and fails the steps it is told to.
#[derive(Default)]
pub struct ScriptedInvoker {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, Failure>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every call to this step, non-recoverably.
    pub fn fail(self: &Arc<Self>, step_id: &str) -> Arc<Self> {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(step_id.to_string(), Failure::Always);
        }
        Arc::clone(self)
    }

    /// Fail the first `times` calls to this step, recoverably.
    pub fn fail_times(self: &Arc<Self>, step_id: &str, times: u32) -> Arc<Self> {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(step_id.to_string(), Failure::Recoverable { remaining: times });
        }
        Arc::clone(self)
    }

    /// Hold every call to this step for `delay` before answering.
    pub fn delay(self: &Arc<Self>, step_id: &str, delay: Duration) -> Arc<Self> {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(step_id.to_string(), delay);
        }
        Arc::clone(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Step ids called, in order.
    pub fn step_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.step_id).collect()
    }

    /// Step ids called in one direction, in order.
    pub fn step_ids_in(&self, direction: Direction) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.direction == direction)
            .map(|c| c.step_id)
            .collect()
    }

    fn next_failure(&self, step_id: &str) -> Option<bool> {
        let mut failures = self.failures.lock().ok()?;
        match failures.get_mut(step_id)? {
            Failure::Always => Some(false),
            Failure::Recoverable { remaining } if *remaining > 0 => {
                *remaining -= 1;
                Some(true)
            }
            Failure::Recoverable { .. } => None,
        }
    }
}

#[async_trait]
impl StepInvoker for ScriptedInvoker {
    async fn invoke(&self, request: &StepRequest) -> Result<Value, StepError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call {
                step_id: request.step_id.clone(),
                transaction_id: request.transaction_id.clone(),
                direction: request.direction,
                attempt: request.attempt,
                idempotency_key: request.idempotency_key,
                input: request.input.clone(),
            });
        }

        let delay = self
            .delays
            .lock()
            .ok()
            .and_then(|d| d.get(&request.step_id).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_failure(&request.step_id) {
            Some(recoverable) => {
                let code = match request.direction {
                    Direction::Forward => StepErrorCode::TransactionFailed,
                    Direction::Compensate => StepErrorCode::CompensationFailed,
                };
                let error = StepError::new(code, format!("{} failed", request.step_id));
                Err(if recoverable { error.recoverable() } else { error })
            }
            None => Ok(json!({ format!("{}Done", request.step_id): true })),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// `[debit, reserve, ship]`; debit is undone by refund, reserve by
/// unreserve, ship has no compensation.
pub fn order_definition() -> SagaDefinition {
    SagaDefinition::new("order")
        .add_transaction(Transaction::new("debit", "payments", "debit").compensated_by("refund"))
        .add_transaction(Transaction::new("reserve", "inventory", "reserve").compensated_by("unreserve"))
        .add_transaction(Transaction::new("ship", "shipping", "ship"))
        .add_compensation(Compensation::new("refund", "payments", "refund"))
        .add_compensation(Compensation::new("unreserve", "inventory", "unreserve"))
}

pub fn coordinator_with(
    invoker: Arc<ScriptedInvoker>,
    config: CoordinatorConfig,
) -> (SagaCoordinator, Arc<InMemorySagaStore>) {
    let store = Arc::new(InMemorySagaStore::new());
    let coordinator = SagaCoordinator::new(
        store.clone(),
        Arc::new(InvokerRegistry::with_fallback(invoker)),
        config,
    );
    (coordinator, store)
}

pub fn coordinator(invoker: Arc<ScriptedInvoker>) -> (SagaCoordinator, Arc<InMemorySagaStore>) {
    coordinator_with(invoker, CoordinatorConfig::default())
}
