//! Transaction and compensation executors.
//!
//! An executor turns one step definition plus the accumulated saga context
//! into a single remote call, bounded by the step timeout. The remote side is
//! abstracted behind [`StepInvoker`]; which invoker handles a call is decided
//! by the step's `service_name` through an [`InvokerRegistry`].
//!
//! Executors never retry. Retry policy belongs to the coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SimulationConfig;
use crate::execution::{ExecutionId, SagaExecution, StepError, StepErrorCode};
use crate::idempotent::step_key;
use crate::types::{Compensation, Transaction};

/// Which way a step moves the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A forward transaction.
    Forward,
    /// A compensation undoing a transaction.
    Compensate,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Compensate => write!(f, "compensate"),
        }
    }
}

/// A single remote call as seen by an invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub execution_id: ExecutionId,
    pub saga_id: String,
    /// Transaction or compensation id.
    pub step_id: String,
    /// Transaction this call belongs to (the undone one for compensations).
    pub transaction_id: String,
    pub service_name: String,
    pub operation: String,
    pub direction: Direction,
    /// Rendered from the step's input template.
    pub input: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Stable across retries and re-invocations of the same step.
    pub idempotency_key: Uuid,
    #[serde(rename = "timeoutMs", with = "crate::types::duration_ms")]
    pub timeout: Duration,
}

/// Trait for the remote side of a step call.
///
/// Implementations perform the actual call to `service_name`/`operation`.
/// An `Ok` value is the operation result to merge into the saga context.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    /// Perform the call.
    async fn invoke(&self, request: &StepRequest) -> Result<Value, StepError>;

    /// Get the invoker name (for logging/debugging).
    fn name(&self) -> &str;
}

/// Registry of invokers keyed by service name.
#[derive(Default, Clone)]
pub struct InvokerRegistry {
    invokers: HashMap<String, Arc<dyn StepInvoker>>,
    fallback: Option<Arc<dyn StepInvoker>>,
}

impl InvokerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that routes every service to one invoker.
    pub fn with_fallback(invoker: Arc<dyn StepInvoker>) -> Self {
        Self {
            invokers: HashMap::new(),
            fallback: Some(invoker),
        }
    }

    /// Register an invoker for a service name.
    pub fn register(&mut self, service_name: impl Into<String>, invoker: Arc<dyn StepInvoker>) {
        self.invokers.insert(service_name.into(), invoker);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, service_name: impl Into<String>, invoker: Arc<dyn StepInvoker>) -> Self {
        self.register(service_name, invoker);
        self
    }

    /// Set the invoker used for unregistered services.
    pub fn set_fallback(&mut self, invoker: Arc<dyn StepInvoker>) {
        self.fallback = Some(invoker);
    }

    /// Get the invoker for a service, falling back if one is set.
    pub fn get(&self, service_name: &str) -> Option<Arc<dyn StepInvoker>> {
        self.invokers
            .get(service_name)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Check if a service has a dedicated invoker.
    pub fn has(&self, service_name: &str) -> bool {
        self.invokers.contains_key(service_name)
    }

    /// Get the number of dedicated invokers.
    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    /// Check if the registry has no dedicated invokers.
    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }
}

async fn call(registry: &InvokerRegistry, request: StepRequest) -> Result<Value, StepError> {
    let Some(invoker) = registry.get(&request.service_name) else {
        warn!(
            service_name = %request.service_name,
            step_id = %request.step_id,
            "No invoker registered for service"
        );
        return Err(StepError::new(
            StepErrorCode::InvocationFailed,
            format!("no invoker registered for service '{}'", request.service_name),
        ));
    };

    debug!(
        execution_id = %request.execution_id,
        step_id = %request.step_id,
        direction = %request.direction,
        attempt = request.attempt,
        invoker = invoker.name(),
        idempotency_key = %request.idempotency_key,
        "Invoking step"
    );

    match tokio::time::timeout(request.timeout, invoker.invoke(&request)).await {
        Ok(result) => result,
        Err(_) => Err(StepError::new(
            StepErrorCode::StepTimeout,
            format!(
                "step '{}' timed out after {}ms",
                request.step_id,
                request.timeout.as_millis()
            ),
        )
        .recoverable()),
    }
}

fn key_for(execution_id: ExecutionId, transaction_id: &str, direction: Direction) -> Result<Uuid, StepError> {
    step_key(execution_id, transaction_id, direction)
        .map_err(|e| StepError::new(StepErrorCode::InvocationFailed, e.to_string()))
}

/// Invokes forward transactions.
#[derive(Clone)]
pub struct TransactionExecutor {
    registry: Arc<InvokerRegistry>,
}

impl TransactionExecutor {
    /// Create an executor over a registry.
    pub const fn new(registry: Arc<InvokerRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke one transaction against the execution's current context.
    ///
    /// # Errors
    ///
    /// Returns the structured step error on remote failure, timeout, or a
    /// missing invoker.
    pub async fn invoke(
        &self,
        execution: &SagaExecution,
        transaction: &Transaction,
        attempt: u32,
    ) -> Result<Value, StepError> {
        let request = StepRequest {
            execution_id: execution.execution_id,
            saga_id: execution.saga_id.clone(),
            step_id: transaction.transaction_id.clone(),
            transaction_id: transaction.transaction_id.clone(),
            service_name: transaction.service_name.clone(),
            operation: transaction.operation.clone(),
            direction: Direction::Forward,
            input: transaction.input_template.render(&execution.context),
            attempt,
            idempotency_key: key_for(
                execution.execution_id,
                &transaction.transaction_id,
                Direction::Forward,
            )?,
            timeout: transaction.timeout,
        };
        call(&self.registry, request).await
    }
}

/// Invokes compensations.
#[derive(Clone)]
pub struct CompensationExecutor {
    registry: Arc<InvokerRegistry>,
}

impl CompensationExecutor {
    /// Create an executor over a registry.
    pub const fn new(registry: Arc<InvokerRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke the compensation of one completed transaction.
    ///
    /// # Errors
    ///
    /// Returns the structured step error on remote failure, timeout, or a
    /// missing invoker.
    pub async fn invoke(
        &self,
        execution: &SagaExecution,
        compensation: &Compensation,
        transaction_id: &str,
    ) -> Result<Value, StepError> {
        let request = StepRequest {
            execution_id: execution.execution_id,
            saga_id: execution.saga_id.clone(),
            step_id: compensation.compensation_id.clone(),
            transaction_id: transaction_id.to_string(),
            service_name: compensation.service_name.clone(),
            operation: compensation.operation.clone(),
            direction: Direction::Compensate,
            input: compensation.input_template.render(&execution.context),
            attempt: 1,
            idempotency_key: key_for(execution.execution_id, transaction_id, Direction::Compensate)?,
            timeout: compensation.timeout,
        };
        call(&self.registry, request).await
    }
}

/// Placeholder remote that sleeps for a random latency and fails at a
/// configured rate.
pub struct SimulatedInvoker {
    config: SimulationConfig,
}

impl SimulatedInvoker {
    /// Create a simulated invoker.
    pub const fn new(config: SimulationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StepInvoker for SimulatedInvoker {
    async fn invoke(&self, request: &StepRequest) -> Result<Value, StepError> {
        let (latency, fails) = {
            let mut rng = rand::thread_rng();
            let min = self.config.min_latency.as_millis();
            let max = self.config.max_latency.as_millis().max(min);
            let millis = u64::try_from(rng.gen_range(min..=max)).unwrap_or(u64::MAX);
            let fails = rng.gen_bool(self.config.failure_probability());
            (Duration::from_millis(millis), fails)
        };

        tokio::time::sleep(latency).await;

        if fails {
            let code = match request.direction {
                Direction::Forward => StepErrorCode::TransactionFailed,
                Direction::Compensate => StepErrorCode::CompensationFailed,
            };
            return Err(StepError::new(
                code,
                format!(
                    "simulated failure of {}.{}",
                    request.service_name, request.operation
                ),
            ));
        }

        let mut result = serde_json::Map::new();
        result.insert(
            request.step_id.clone(),
            json!({
                "service": request.service_name,
                "operation": request.operation,
                "idempotencyKey": request.idempotency_key,
                "completedAt": Utc::now(),
            }),
        );
        Ok(Value::Object(result))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// An invoker that succeeds with no result.
pub struct NoOpInvoker {
    name: String,
}

impl NoOpInvoker {
    /// Create a new no-op invoker with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl StepInvoker for NoOpInvoker {
    async fn invoke(&self, _request: &StepRequest) -> Result<Value, StepError> {
        Ok(Value::Null)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An invoker that always fails (for testing).
pub struct FailingInvoker {
    name: String,
    error_message: String,
    recoverable: bool,
}

impl FailingInvoker {
    /// Create a new failing invoker.
    pub fn new(name: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error_message: error_message.into(),
            recoverable: false,
        }
    }

    /// Report failures as recoverable.
    #[must_use]
    pub const fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }
}

#[async_trait]
impl StepInvoker for FailingInvoker {
    async fn invoke(&self, request: &StepRequest) -> Result<Value, StepError> {
        let code = match request.direction {
            Direction::Forward => StepErrorCode::TransactionFailed,
            Direction::Compensate => StepErrorCode::CompensationFailed,
        };
        let error = StepError::new(code, &self.error_message);
        Err(if self.recoverable { error.recoverable() } else { error })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An invoker that runs a closure.
pub struct FnInvoker<F>
where
    F: Fn(&StepRequest) -> Result<Value, StepError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnInvoker<F>
where
    F: Fn(&StepRequest) -> Result<Value, StepError> + Send + Sync,
{
    /// Create a new function invoker.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> StepInvoker for FnInvoker<F>
where
    F: Fn(&StepRequest) -> Result<Value, StepError> + Send + Sync,
{
    async fn invoke(&self, request: &StepRequest) -> Result<Value, StepError> {
        (self.func)(request)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
