//! Saga coordinator.
//!
//! Drives one execution from `running` to a terminal status. Every decision
//! is made against a fresh read of the stored record and every transition is
//! written before the next remote call, so a crashed run can be picked up by
//! [`SagaCoordinator::resume`] on any instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::definition::DefinitionStore;
use crate::error::{Error, Result};
use crate::events::{EventPublisher, NoOpPublisher, SagaEvent, SagaEventKind};
use crate::execution::{
    CompensationStep, ExecutionId, SagaExecution, SagaStatus, StatusProjection, StepError,
    StepErrorCode,
};
use crate::executor::{CompensationExecutor, InvokerRegistry, TransactionExecutor};
use crate::storage::{ExecutionFilter, SagaStore};
use crate::types::{Compensation, SagaDefinition};

/// Bound on reload-and-reapply rounds after a revision conflict.
const MAX_CONFLICT_RETRIES: u32 = 5;

/// Saga coordinator.
pub struct SagaCoordinator {
    store: Arc<dyn SagaStore>,
    definitions: DefinitionStore,
    transactions: TransactionExecutor,
    compensations: CompensationExecutor,
    publisher: Arc<dyn EventPublisher>,
    config: CoordinatorConfig,
}

/// Outcome of one step of the drive loop.
enum Progress {
    /// State moved; decide again.
    Continue,
    /// Another invocation owns the in-flight step.
    Yield,
}

impl SagaCoordinator {
    /// Create a new coordinator.
    pub fn new(
        store: Arc<dyn SagaStore>,
        invokers: Arc<InvokerRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            definitions: DefinitionStore::new(Arc::clone(&store), config.partition.clone()),
            store,
            transactions: TransactionExecutor::new(Arc::clone(&invokers)),
            compensations: CompensationExecutor::new(invokers),
            publisher: Arc::new(NoOpPublisher),
            config,
        }
    }

    /// Set the lifecycle event publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Get the coordinator configuration.
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Validate and store a new saga definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationFailed`] or [`Error::AlreadyExists`].
    pub async fn create_saga(&self, definition: &SagaDefinition) -> Result<SagaDefinition> {
        self.definitions.create(definition).await
    }

    /// Get a saga definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SagaNotFound`] if no such saga exists.
    pub async fn get_definition(&self, saga_id: &str) -> Result<SagaDefinition> {
        self.definitions.get(saga_id).await
    }

    /// Start a new execution of a saga and drive it until it stops.
    ///
    /// A saga that ends `compensated` or `failed` is still `Ok`; the business
    /// outcome is on the returned record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SagaNotFound`] for an unknown saga, or a storage error.
    pub async fn start_saga(
        &self,
        saga_id: &str,
        context: Map<String, Value>,
    ) -> Result<SagaExecution> {
        let definition = self.definitions.get(saga_id).await?;
        let execution = self
            .store
            .create_execution(&self.config.partition, &SagaExecution::new(&definition, context))
            .await?;

        info!(
            execution_id = %execution.execution_id,
            saga_id = %execution.saga_id,
            transactions = execution.transactions.len(),
            "Starting saga"
        );
        self.publish(SagaEventKind::SagaStarted, &execution).await;

        self.drive(&definition, execution.execution_id).await
    }

    /// Get an execution record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionNotFound`] if no such execution exists.
    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<SagaExecution> {
        self.store
            .load_execution(&self.config.partition, execution_id)
            .await?
            .ok_or_else(|| Error::execution_not_found(execution_id))
    }

    /// Get the status projection of an execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionNotFound`] if no such execution exists.
    pub async fn get_status(&self, execution_id: ExecutionId) -> Result<StatusProjection> {
        Ok(self.get_execution(execution_id).await?.status_projection())
    }

    /// List executions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the listing fails.
    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<SagaExecution>> {
        self.store
            .list_executions(&self.config.partition, filter)
            .await
    }

    /// Continue a stopped execution.
    ///
    /// Completed steps are never re-invoked. A step left `running` by a
    /// crashed run is invoked again under its original idempotency key once
    /// its lease has lapsed; while the lease is live another run owns the
    /// step and this call returns the record as it stands. Resuming a
    /// terminal execution returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionNotFound`], [`Error::SagaNotFound`] if the
    /// definition disappeared, or a storage error.
    pub async fn resume(&self, execution_id: ExecutionId) -> Result<SagaExecution> {
        let execution = self.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(execution_id = %execution_id, status = %execution.status, "Execution already terminal");
            return Ok(execution);
        }

        let definition = self.definitions.get(&execution.saga_id).await?;

        if execution.clone().reset_interrupted(Utc::now()) {
            warn!(
                execution_id = %execution_id,
                saga_id = %execution.saga_id,
                "Re-invoking steps interrupted mid-call"
            );
            self.commit(execution_id, |e| {
                e.reset_interrupted(Utc::now());
                Ok(())
            })
            .await?;
        }

        info!(execution_id = %execution_id, saga_id = %execution.saga_id, status = %execution.status, "Resuming saga");
        self.drive(&definition, execution_id).await
    }

    /// Resume every non-terminal execution in the partition.
    ///
    /// Meant for process start-up. Failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the listing itself fails.
    pub async fn recover_incomplete(&self) -> Result<Vec<SagaExecution>> {
        let pending = self
            .list_executions(&ExecutionFilter::all().incomplete())
            .await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Recovering incomplete sagas");
        }

        let mut recovered = Vec::with_capacity(pending.len());
        for execution in pending {
            match self.resume(execution.execution_id).await {
                Ok(resumed) => recovered.push(resumed),
                Err(err) => error!(
                    execution_id = %execution.execution_id,
                    saga_id = %execution.saga_id,
                    error = %err,
                    "Failed to recover saga"
                ),
            }
        }
        Ok(recovered)
    }

    /// Request cooperative cancellation.
    ///
    /// The step in flight finishes; no further transaction starts and the
    /// saga compensates what already completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionNotFound`] or [`Error::ExecutionTerminal`].
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<SagaExecution> {
        let execution = self.commit(execution_id, SagaExecution::request_cancel).await?;
        info!(execution_id = %execution_id, saga_id = %execution.saga_id, "Cancellation requested");
        Ok(execution)
    }

    /// Check that the backing store is reachable.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is unavailable.
    pub async fn health(&self) -> Result<()> {
        self.store.health_check().await
    }

    async fn drive(&self, definition: &SagaDefinition, execution_id: ExecutionId) -> Result<SagaExecution> {
        loop {
            let execution = self.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }

            let progress = match execution.status {
                SagaStatus::Running => self.step_forward(definition, &execution).await,
                SagaStatus::Compensating => self.step_backward(definition, &execution).await,
                SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed => {
                    return Ok(execution);
                }
            };

            match progress {
                Ok(Progress::Continue) => {}
                Ok(Progress::Yield) => {
                    debug!(execution_id = %execution_id, "Step owned by another run, yielding");
                    return self.get_execution(execution_id).await;
                }
                // Lost a race on the record; the next read shows who won.
                Err(Error::InvalidTransition { from, to }) => {
                    debug!(execution_id = %execution_id, from = %from, to = %to, "Transition raced, re-reading");
                }
                Err(Error::ExecutionTerminal { .. }) => {
                    return self.get_execution(execution_id).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn step_forward(&self, definition: &SagaDefinition, execution: &SagaExecution) -> Result<Progress> {
        if execution.running_transaction().is_some() {
            return Ok(Progress::Yield);
        }

        let Some(index) = execution.next_pending() else {
            if !execution.all_completed() {
                return Err(Error::invalid_transition(execution.status, SagaStatus::Completed));
            }
            self.commit(execution.execution_id, |e| e.transition(SagaStatus::Completed))
                .await?;
            return Ok(Progress::Continue);
        };

        let transaction_id = execution
            .transactions
            .get(index)
            .map(|t| t.transaction_id.clone())
            .unwrap_or_default();

        if let Some(reason) = self.stop_reason(definition, execution) {
            warn!(
                execution_id = %execution.execution_id,
                saga_id = %execution.saga_id,
                transaction_id = %transaction_id,
                code = %reason.code,
                "Stopping forward execution"
            );
            self.commit(execution.execution_id, |e| e.fail_transaction(index, reason.clone()))
                .await?;
            return Ok(Progress::Continue);
        }

        self.run_transaction(definition, execution.execution_id, index)
            .await?;
        Ok(Progress::Continue)
    }

    /// Cancellation or saga timeout, checked before each transaction starts.
    fn stop_reason(&self, definition: &SagaDefinition, execution: &SagaExecution) -> Option<StepError> {
        if execution.cancel_requested {
            return Some(StepError::new(StepErrorCode::Cancelled, "saga cancelled by request"));
        }
        if self.config.enforce_saga_timeout {
            if let Some(elapsed) = execution.saga_timeout_elapsed(definition.timeout, Utc::now()) {
                return Some(
                    StepError::new(
                        StepErrorCode::SagaTimeout,
                        format!(
                            "saga timeout of {}ms elapsed before the next transaction",
                            definition.timeout.as_millis()
                        ),
                    )
                    .with_details(serde_json::json!({
                        "elapsedMs": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
                    })),
                );
            }
        }
        None
    }

    async fn run_transaction(
        &self,
        definition: &SagaDefinition,
        execution_id: ExecutionId,
        index: usize,
    ) -> Result<()> {
        let transaction = definition.transactions.get(index).ok_or_else(|| {
            Error::storage(
                "run_transaction",
                format!("definition '{}' has no transaction #{index}", definition.saga_id),
            )
        })?;

        let mut execution = self
            .commit(execution_id, |e| {
                e.begin_transaction(index)?;
                e.lease_transaction(index, self.lease_until(transaction.timeout))
            })
            .await?;
        let max_attempts = if self.config.honor_retry_policy {
            transaction.max_attempts()
        } else {
            1
        };
        let mut attempt = execution
            .transactions
            .get(index)
            .map_or(1, |t| t.retry_count.saturating_add(1));

        loop {
            info!(
                execution_id = %execution_id,
                saga_id = %definition.saga_id,
                transaction_id = %transaction.transaction_id,
                service = %transaction.service_name,
                operation = %transaction.operation,
                attempt,
                "Executing transaction"
            );

            match self.transactions.invoke(&execution, transaction, attempt).await {
                Ok(result) => {
                    self.commit(execution_id, |e| {
                        e.check_attempt(index, attempt)?;
                        e.complete_transaction(index, result.clone())
                    })
                    .await?;
                    info!(
                        execution_id = %execution_id,
                        transaction_id = %transaction.transaction_id,
                        "Transaction completed"
                    );
                    return Ok(());
                }
                Err(step_error) if step_error.recoverable && attempt < max_attempts => {
                    let delay = transaction
                        .retry_policy
                        .clone()
                        .unwrap_or_default()
                        .backoff(attempt, self.config.max_backoff);
                    warn!(
                        execution_id = %execution_id,
                        transaction_id = %transaction.transaction_id,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %step_error,
                        "Transaction failed, retrying"
                    );
                    let hold = delay.saturating_add(transaction.timeout);
                    execution = self
                        .commit(execution_id, |e| {
                            e.check_attempt(index, attempt)?;
                            e.record_retry(index, step_error.clone())?;
                            e.lease_transaction(index, self.lease_until(hold))
                        })
                        .await?;
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(step_error) => {
                    warn!(
                        execution_id = %execution_id,
                        saga_id = %definition.saga_id,
                        transaction_id = %transaction.transaction_id,
                        attempt,
                        error = %step_error,
                        "Transaction failed, compensating"
                    );
                    self.commit(execution_id, |e| {
                        e.check_attempt(index, attempt)?;
                        e.fail_transaction(index, step_error.clone())
                    })
                    .await?;
                    return Ok(());
                }
            }
        }
    }

    async fn step_backward(&self, definition: &SagaDefinition, execution: &SagaExecution) -> Result<Progress> {
        match execution.next_compensation(definition) {
            CompensationStep::Run {
                transaction_index,
                compensation,
            } => {
                self.run_compensation(definition, execution.execution_id, transaction_index, compensation)
                    .await?;
                Ok(Progress::Continue)
            }
            CompensationStep::InFlight => Ok(Progress::Yield),
            CompensationStep::Done => {
                self.commit(execution.execution_id, |e| e.transition(SagaStatus::Compensated))
                    .await?;
                Ok(Progress::Continue)
            }
        }
    }

    async fn run_compensation(
        &self,
        definition: &SagaDefinition,
        execution_id: ExecutionId,
        transaction_index: usize,
        compensation: &Compensation,
    ) -> Result<()> {
        let execution = self
            .commit(execution_id, |e| {
                e.begin_compensation(transaction_index, &compensation.compensation_id)?;
                e.lease_compensation(transaction_index, self.lease_until(compensation.timeout))
            })
            .await?;
        let transaction_id = execution
            .transactions
            .get(transaction_index)
            .map(|t| t.transaction_id.clone())
            .unwrap_or_default();

        info!(
            execution_id = %execution_id,
            saga_id = %definition.saga_id,
            transaction_id = %transaction_id,
            compensation_id = %compensation.compensation_id,
            "Executing compensation"
        );

        match self
            .compensations
            .invoke(&execution, compensation, &transaction_id)
            .await
        {
            Ok(result) => {
                self.commit(execution_id, |e| {
                    e.complete_compensation(transaction_index, result.clone())
                })
                .await?;
                info!(
                    execution_id = %execution_id,
                    compensation_id = %compensation.compensation_id,
                    "Compensation completed"
                );
            }
            Err(step_error) => {
                error!(
                    execution_id = %execution_id,
                    saga_id = %definition.saga_id,
                    transaction_id = %transaction_id,
                    compensation_id = %compensation.compensation_id,
                    error = %step_error,
                    "Compensation failed, saga cannot be fully rolled back"
                );
                self.commit(execution_id, |e| {
                    e.fail_compensation(definition, transaction_index, step_error.clone())
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Read, apply, and write one transition.
    ///
    /// On a revision conflict the record is re-read and the change is
    /// re-applied to the newer state. The write that moves the execution into
    /// a terminal status publishes the matching lifecycle event.
    async fn commit<F>(&self, execution_id: ExecutionId, mut apply: F) -> Result<SagaExecution>
    where
        F: FnMut(&mut SagaExecution) -> Result<()> + Send,
    {
        let mut conflicts = 0;
        loop {
            let mut execution = self.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Err(Error::execution_terminal(execution_id, execution.status));
            }
            apply(&mut execution)?;

            match self
                .store
                .save_execution(&self.config.partition, &execution)
                .await
            {
                Ok(saved) => {
                    if let Some(kind) = SagaEventKind::for_terminal(saved.status) {
                        info!(
                            execution_id = %execution_id,
                            saga_id = %saved.saga_id,
                            status = %saved.status,
                            "Saga finished"
                        );
                        self.publish(kind, &saved).await;
                    }
                    return Ok(saved);
                }
                Err(Error::Conflict { expected, found, .. }) if conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(
                        execution_id = %execution_id,
                        expected,
                        found,
                        conflicts,
                        "Revision conflict, re-reading execution"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// End of the lease for a step that may hold the call for `hold`.
    fn lease_until(&self, hold: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(hold.saturating_add(self.config.lease_grace))
            .ok()
            .and_then(|lease| Utc::now().checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn publish(&self, kind: SagaEventKind, execution: &SagaExecution) {
        if let Err(err) = self.publisher.publish(SagaEvent::new(kind, execution)).await {
            warn!(
                execution_id = %execution.execution_id,
                saga_id = %execution.saga_id,
                event = %kind,
                error = %err,
                "Failed to publish saga event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::events::RecordingPublisher;
    use crate::executor::{FailingInvoker, NoOpInvoker};
    use crate::storage::InMemorySagaStore;
    use crate::types::Transaction;

    fn definition() -> SagaDefinition {
        SagaDefinition::new("order")
            .add_transaction(Transaction::new("debit", "payments", "debit").compensated_by("refund"))
            .add_transaction(Transaction::new("ship", "shipping", "ship"))
            .add_compensation(Compensation::new("refund", "payments", "refund"))
    }

    #[tokio::test]
    async fn test_start_unknown_saga() {
        let coordinator = SagaCoordinator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(InvokerRegistry::new()),
            CoordinatorConfig::default(),
        );
        let err = coordinator.start_saga("missing", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::SagaNotFound { .. }));
    }

    #[tokio::test]
    async fn test_events_for_compensated_run() {
        let registry = InvokerRegistry::new()
            .with("payments", Arc::new(NoOpInvoker::new("payments")))
            .with("shipping", Arc::new(FailingInvoker::new("shipping", "no truck")));
        let recorder = Arc::new(RecordingPublisher::new());
        let coordinator = SagaCoordinator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(registry),
            CoordinatorConfig::default(),
        )
        .with_publisher(recorder.clone());

        coordinator.create_saga(&definition()).await.unwrap();
        let execution = coordinator.start_saga("order", Map::new()).await.unwrap();

        assert_eq!(execution.status, SagaStatus::Compensated);
        assert_eq!(
            recorder.kinds(),
            vec![SagaEventKind::SagaStarted, SagaEventKind::SagaCompensated]
        );
        let terminal = &recorder.events()[1];
        assert_eq!(terminal.error.as_ref().unwrap().message, "no truck");
    }

    #[tokio::test]
    async fn test_cancel_terminal_execution_rejected() {
        let coordinator = SagaCoordinator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(InvokerRegistry::with_fallback(Arc::new(NoOpInvoker::new("ok")))),
            CoordinatorConfig::default(),
        );
        coordinator.create_saga(&definition()).await.unwrap();
        let execution = coordinator.start_saga("order", Map::new()).await.unwrap();
        assert_eq!(execution.status, SagaStatus::Completed);

        let err = coordinator.cancel(execution.execution_id).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionTerminal { .. }));
    }
}
