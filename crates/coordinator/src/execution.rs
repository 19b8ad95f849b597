//! Saga execution records and their state machine.
//!
//! A [`SagaExecution`] is the single persisted record of one run. All
//! mutation goes through the methods here so that the transition rules hold
//! no matter which coordinator instance applies them.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::types::SagaDefinition;

/// Unique identifier for a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(Ulid);

impl ExecutionId {
    /// Create a new random execution ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Create from a ULID.
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the inner ULID.
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Saga-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Forward transactions are executing.
    Running,
    /// Every transaction completed.
    Completed,
    /// A transaction failed; compensations are executing.
    Compensating,
    /// A transaction failed and every required compensation completed.
    Compensated,
    /// A transaction failed and a compensation also failed.
    Failed,
}

impl SagaStatus {
    /// Check if no further transition is possible.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    /// Check if the saga can transition to the given status.
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Running, Self::Completed)
                | (Self::Running, Self::Compensating)
                | (Self::Compensating, Self::Compensated)
                | (Self::Compensating, Self::Failed)
        )
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Status of one forward transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        };
        write!(f, "{s}")
    }
}

/// Status of one compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Machine-readable step failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepErrorCode {
    /// The remote transaction reported failure.
    TransactionFailed,
    /// The remote compensation reported failure.
    CompensationFailed,
    /// The call did not return within the step timeout.
    StepTimeout,
    /// The overall saga deadline passed before the step started.
    SagaTimeout,
    /// Cancellation was requested before the step started.
    Cancelled,
    /// The call could not be made at all.
    InvocationFailed,
}

impl std::fmt::Display for StepErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransactionFailed => "TRANSACTION_FAILED",
            Self::CompensationFailed => "COMPENSATION_FAILED",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::SagaTimeout => "SAGA_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::InvocationFailed => "INVOCATION_FAILED",
        };
        write!(f, "{s}")
    }
}

/// Structured failure stored on a step or saga record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub code: StepErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether another attempt of the same step may succeed.
    pub recoverable: bool,
}

impl StepError {
    /// Create a non-recoverable error.
    pub fn new(code: StepErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            recoverable: false,
        }
    }

    /// Mark the error as recoverable by retry.
    #[must_use]
    pub const fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }

    /// Attach details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Execution state of one forward transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionExecution {
    pub transaction_id: String,
    pub status: TransactionStatus,
    /// Set when the transaction first leaves `pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub retry_count: u32,
    /// While running, the run that owns the call holds it until this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl TransactionExecution {
    fn pending(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status: TransactionStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            lease_expires_at: None,
        }
    }
}

/// Execution state of one compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationExecution {
    pub compensation_id: String,
    /// Transaction this compensation undoes.
    pub transaction_id: String,
    pub status: CompensationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// While running, the run that owns the call holds it until this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// A running step with no lease, or a lapsed one, has no live owner.
fn lease_lapsed(lease_expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    lease_expires_at.is_none_or(|until| until <= now)
}

/// Persisted record of one saga run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaExecution {
    pub execution_id: ExecutionId,
    pub saga_id: String,
    pub status: SagaStatus,
    /// One entry per definition transaction, in definition order.
    pub transactions: Vec<TransactionExecution>,
    /// Appended as compensation proceeds, most recent transaction first.
    pub compensations: Vec<CompensationExecution>,
    /// Caller seed enriched by every successful transaction result.
    pub context: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Cooperative cancellation flag, checked before each transaction.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Store revision this copy was read at. Zero until first persisted.
    #[serde(default)]
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl SagaExecution {
    /// Create a running execution with every transaction pending.
    pub fn new(definition: &SagaDefinition, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ExecutionId::new(),
            saga_id: definition.saga_id.clone(),
            status: SagaStatus::Running,
            transactions: definition
                .transactions
                .iter()
                .map(|t| TransactionExecution::pending(&t.transaction_id))
                .collect(),
            compensations: Vec::new(),
            context,
            started_at: now,
            completed_at: None,
            error: None,
            cancel_requested: false,
            revision: 0,
            updated_at: now,
        }
    }

    /// Change the saga status, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] for a disallowed change.
    pub fn transition(&mut self, to: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::invalid_transition(self.status, to));
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Index of the first transaction still pending.
    pub fn next_pending(&self) -> Option<usize> {
        self.transactions
            .iter()
            .position(|t| t.status == TransactionStatus::Pending)
    }

    /// Index of a transaction currently marked running.
    pub fn running_transaction(&self) -> Option<usize> {
        self.transactions
            .iter()
            .position(|t| t.status == TransactionStatus::Running)
    }

    /// Check if every transaction completed.
    pub fn all_completed(&self) -> bool {
        self.transactions
            .iter()
            .all(|t| t.status == TransactionStatus::Completed)
    }

    fn transaction_at(&mut self, index: usize) -> Result<&mut TransactionExecution> {
        let execution_id = self.execution_id;
        self.transactions
            .get_mut(index)
            .ok_or_else(|| Error::storage("transaction_at", format!("execution {execution_id} has no transaction #{index}")))
    }

    fn require_status(&self, expected: SagaStatus, to: impl std::fmt::Display) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(Error::invalid_transition(self.status, to))
        }
    }

    /// Mark a pending transaction running.
    ///
    /// Only the first pending transaction may start, and only while every
    /// earlier transaction is completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the transaction is not the
    /// next eligible one.
    pub fn begin_transaction(&mut self, index: usize) -> Result<()> {
        self.require_status(SagaStatus::Running, TransactionStatus::Running)?;
        let predecessors_done = self
            .transactions
            .iter()
            .take(index)
            .all(|t| t.status == TransactionStatus::Completed);
        let tx = self.transaction_at(index)?;
        if tx.status != TransactionStatus::Pending || !predecessors_done {
            return Err(Error::invalid_transition(tx.status, TransactionStatus::Running));
        }
        let now = Utc::now();
        tx.status = TransactionStatus::Running;
        tx.started_at.get_or_insert(now);
        self.updated_at = now;
        Ok(())
    }

    /// Count another attempt of a running transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the transaction is not running.
    pub fn record_retry(&mut self, index: usize, error: StepError) -> Result<()> {
        let tx = self.transaction_at(index)?;
        if tx.status != TransactionStatus::Running {
            return Err(Error::invalid_transition(tx.status, TransactionStatus::Running));
        }
        tx.retry_count = tx.retry_count.saturating_add(1);
        tx.error = Some(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark a running transaction completed and merge its result.
    ///
    /// Object results are merged key by key into the context; any other
    /// non-null result is stored under the transaction id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the transaction is not running.
    pub fn complete_transaction(&mut self, index: usize, result: Value) -> Result<()> {
        self.require_status(SagaStatus::Running, TransactionStatus::Completed)?;
        let tx = self.transaction_at(index)?;
        if tx.status != TransactionStatus::Running {
            return Err(Error::invalid_transition(tx.status, TransactionStatus::Completed));
        }
        let now = Utc::now();
        tx.status = TransactionStatus::Completed;
        tx.completed_at = Some(now);
        tx.lease_expires_at = None;
        tx.error = None;
        tx.result = Some(result.clone());
        let transaction_id = tx.transaction_id.clone();
        match result {
            Value::Object(fields) => self.context.extend(fields),
            Value::Null => {}
            other => {
                self.context.insert(transaction_id, other);
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Fail a pending or running transaction and switch to compensating.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the saga is not running or the
    /// transaction already finished.
    pub fn fail_transaction(&mut self, index: usize, error: StepError) -> Result<()> {
        self.require_status(SagaStatus::Running, SagaStatus::Compensating)?;
        let tx = self.transaction_at(index)?;
        if !matches!(tx.status, TransactionStatus::Pending | TransactionStatus::Running) {
            return Err(Error::invalid_transition(tx.status, TransactionStatus::Failed));
        }
        let now = Utc::now();
        tx.status = TransactionStatus::Failed;
        tx.started_at.get_or_insert(now);
        tx.completed_at = Some(now);
        tx.lease_expires_at = None;
        tx.error = Some(error.clone());
        self.error = Some(error);
        self.transition(SagaStatus::Compensating)
    }

    /// Hold a running transaction for the calling run until `until`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the transaction is not running.
    pub fn lease_transaction(&mut self, index: usize, until: DateTime<Utc>) -> Result<()> {
        let tx = self.transaction_at(index)?;
        if tx.status != TransactionStatus::Running {
            return Err(Error::invalid_transition(tx.status, TransactionStatus::Running));
        }
        tx.lease_expires_at = Some(until);
        Ok(())
    }

    /// Check that the running transaction is still on the caller's attempt.
    ///
    /// Every retry and every takeover of an interrupted call bumps
    /// `retry_count`, so a run whose attempt no longer matches has lost the
    /// step to another run and must not write its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the transaction is not running
    /// or is on another attempt.
    pub fn check_attempt(&mut self, index: usize, attempt: u32) -> Result<()> {
        let tx = self.transaction_at(index)?;
        if tx.status != TransactionStatus::Running || tx.retry_count.saturating_add(1) != attempt {
            return Err(Error::invalid_transition(tx.status, TransactionStatus::Running));
        }
        Ok(())
    }

    /// Hold the running compensation of a transaction until `until`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if no compensation is running for
    /// the transaction.
    pub fn lease_compensation(&mut self, transaction_index: usize, until: DateTime<Utc>) -> Result<()> {
        let transaction_id = self.transaction_at(transaction_index)?.transaction_id.clone();
        let record = self
            .compensation_record_mut(&transaction_id)
            .filter(|r| r.status == CompensationStatus::Running)
            .ok_or_else(|| Error::invalid_transition(CompensationStatus::Pending, CompensationStatus::Running))?;
        record.lease_expires_at = Some(until);
        Ok(())
    }

    /// Put steps interrupted mid-call back into a re-runnable state.
    ///
    /// A transaction or compensation found `running` whose lease lapsed
    /// before `now` was cut off by a crash; it returns to `pending` and will
    /// be invoked again under the same idempotency key. Steps still under a
    /// live lease belong to another run and are left alone. Returns whether
    /// anything changed.
    pub fn reset_interrupted(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for tx in &mut self.transactions {
            if tx.status == TransactionStatus::Running && lease_lapsed(tx.lease_expires_at, now) {
                tx.status = TransactionStatus::Pending;
                tx.retry_count = tx.retry_count.saturating_add(1);
                tx.lease_expires_at = None;
                changed = true;
            }
        }
        for comp in &mut self.compensations {
            if comp.status == CompensationStatus::Running && lease_lapsed(comp.lease_expires_at, now) {
                comp.status = CompensationStatus::Pending;
                comp.lease_expires_at = None;
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Next compensation step in reverse definition order.
    pub fn next_compensation<'a>(&self, definition: &'a SagaDefinition) -> CompensationStep<'a> {
        for (index, transaction) in definition.transactions.iter().enumerate().rev() {
            let completed = self
                .transactions
                .get(index)
                .is_some_and(|t| t.status == TransactionStatus::Completed);
            if !completed {
                continue;
            }
            let Some(compensation) = definition.compensation_for(transaction) else {
                continue;
            };
            return match self.compensation_record(&transaction.transaction_id) {
                Some(record) if record.status == CompensationStatus::Running => {
                    CompensationStep::InFlight
                }
                Some(record) if record.status == CompensationStatus::Failed => {
                    CompensationStep::Done
                }
                _ => CompensationStep::Run {
                    transaction_index: index,
                    compensation,
                },
            };
        }
        CompensationStep::Done
    }

    fn compensation_record(&self, transaction_id: &str) -> Option<&CompensationExecution> {
        self.compensations
            .iter()
            .find(|c| c.transaction_id == transaction_id)
    }

    fn compensation_record_mut(&mut self, transaction_id: &str) -> Option<&mut CompensationExecution> {
        self.compensations
            .iter_mut()
            .find(|c| c.transaction_id == transaction_id)
    }

    /// Start (or restart) the compensation of a completed transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the saga is not compensating,
    /// the transaction is not completed, or the compensation already runs.
    pub fn begin_compensation(&mut self, transaction_index: usize, compensation_id: &str) -> Result<()> {
        self.require_status(SagaStatus::Compensating, CompensationStatus::Running)?;
        let tx = self.transaction_at(transaction_index)?;
        if tx.status != TransactionStatus::Completed {
            return Err(Error::invalid_transition(tx.status, TransactionStatus::Compensated));
        }
        let transaction_id = tx.transaction_id.clone();
        let now = Utc::now();
        match self.compensation_record_mut(&transaction_id) {
            Some(record) if record.status == CompensationStatus::Pending => {
                record.status = CompensationStatus::Running;
            }
            Some(record) => {
                return Err(Error::invalid_transition(record.status, CompensationStatus::Running));
            }
            None => self.compensations.push(CompensationExecution {
                compensation_id: compensation_id.to_string(),
                transaction_id,
                status: CompensationStatus::Running,
                started_at: now,
                completed_at: None,
                result: None,
                error: None,
                lease_expires_at: None,
            }),
        }
        self.updated_at = now;
        Ok(())
    }

    /// Mark a running compensation completed and its transaction compensated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if no compensation is running for
    /// the transaction.
    pub fn complete_compensation(&mut self, transaction_index: usize, result: Value) -> Result<()> {
        self.require_status(SagaStatus::Compensating, CompensationStatus::Completed)?;
        let now = Utc::now();
        let tx = self.transaction_at(transaction_index)?;
        let transaction_id = tx.transaction_id.clone();
        let record = self
            .compensation_record_mut(&transaction_id)
            .filter(|r| r.status == CompensationStatus::Running)
            .ok_or_else(|| Error::invalid_transition(CompensationStatus::Pending, CompensationStatus::Completed))?;
        record.status = CompensationStatus::Completed;
        record.completed_at = Some(now);
        record.lease_expires_at = None;
        record.result = Some(result);
        let tx = self.transaction_at(transaction_index)?;
        tx.status = TransactionStatus::Compensated;
        self.updated_at = now;
        Ok(())
    }

    /// Mark a running compensation failed and the saga terminally failed.
    ///
    /// The saga-level error records the compensation failure, the original
    /// transaction failure, and every transaction left uncompensated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if no compensation is running for
    /// the transaction.
    pub fn fail_compensation(
        &mut self,
        definition: &SagaDefinition,
        transaction_index: usize,
        error: StepError,
    ) -> Result<()> {
        self.require_status(SagaStatus::Compensating, SagaStatus::Failed)?;
        let now = Utc::now();
        let tx = self.transaction_at(transaction_index)?;
        let transaction_id = tx.transaction_id.clone();
        let record = self
            .compensation_record_mut(&transaction_id)
            .filter(|r| r.status == CompensationStatus::Running)
            .ok_or_else(|| Error::invalid_transition(CompensationStatus::Pending, CompensationStatus::Failed))?;
        record.status = CompensationStatus::Failed;
        record.completed_at = Some(now);
        record.lease_expires_at = None;
        record.error = Some(error.clone());

        let uncompensated: Vec<String> = self
            .transactions
            .iter()
            .zip(&definition.transactions)
            .filter(|(t, d)| {
                t.status == TransactionStatus::Completed && definition.compensation_for(d).is_some()
            })
            .map(|(t, _)| t.transaction_id.clone())
            .collect();

        let cause = self.error.take();
        self.error = Some(
            StepError::new(
                StepErrorCode::CompensationFailed,
                format!(
                    "compensation '{}' for transaction '{transaction_id}' failed: {}",
                    record_compensation_id(definition, transaction_index),
                    error.message
                ),
            )
            .with_details(serde_json::json!({
                "compensationError": error,
                "transactionError": cause,
                "uncompensated": uncompensated,
            })),
        );
        self.transition(SagaStatus::Failed)
    }

    /// Time run past `timeout` as of `now`, if the saga overran it.
    ///
    /// Reaching the deadline exactly is not an overrun.
    pub fn saga_timeout_elapsed(&self, timeout: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let elapsed = (now - self.started_at).to_std().unwrap_or_default();
        (elapsed > timeout).then_some(elapsed)
    }

    /// Record a cancellation request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionTerminal`] if the execution already ended.
    pub fn request_cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::execution_terminal(self.execution_id, self.status));
        }
        self.cancel_requested = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Cheap status projection for polling.
    pub fn status_projection(&self) -> StatusProjection {
        StatusProjection {
            execution_id: self.execution_id,
            saga_id: self.saga_id.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            transaction_count: self.transactions.len(),
            completed_count: self
                .transactions
                .iter()
                .filter(|t| {
                    matches!(
                        t.status,
                        TransactionStatus::Completed | TransactionStatus::Compensated
                    )
                })
                .count(),
            compensation_count: self.compensations.len(),
        }
    }
}

fn record_compensation_id(definition: &SagaDefinition, transaction_index: usize) -> String {
    definition
        .transactions
        .get(transaction_index)
        .and_then(|t| t.compensation_id.clone())
        .unwrap_or_default()
}

/// What the compensation pass should do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompensationStep<'a> {
    /// Run this compensation for the transaction at this index.
    Run {
        transaction_index: usize,
        compensation: &'a crate::types::Compensation,
    },
    /// Another invocation currently owns the next compensation.
    InFlight,
    /// Nothing left to compensate.
    Done,
}

/// Status projection returned by status polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusProjection {
    pub execution_id: ExecutionId,
    pub saga_id: String,
    pub status: SagaStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub transaction_count: usize,
    /// Transactions that reached `completed`, including ones later compensated.
    pub completed_count: usize,
    pub compensation_count: usize,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::types::{Compensation, Transaction};
    use serde_json::json;

    fn definition() -> SagaDefinition {
        SagaDefinition::new("order")
            .add_transaction(Transaction::new("debit", "payments", "debit").compensated_by("refund"))
            .add_transaction(Transaction::new("reserve", "inventory", "reserve").compensated_by("unreserve"))
            .add_transaction(Transaction::new("ship", "shipping", "ship"))
            .add_compensation(Compensation::new("refund", "payments", "refund"))
            .add_compensation(Compensation::new("unreserve", "inventory", "unreserve"))
    }

    fn failure() -> StepError {
        StepError::new(StepErrorCode::TransactionFailed, "boom")
    }

    #[test]
    fn test_new_execution_all_pending() {
        let exec = SagaExecution::new(&definition(), Map::new());
        assert_eq!(exec.status, SagaStatus::Running);
        assert_eq!(exec.transactions.len(), 3);
        assert_eq!(exec.next_pending(), Some(0));
        assert!(exec.compensations.is_empty());
    }

    #[test]
    fn test_status_transitions() {
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Completed));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Failed));
        assert!(!SagaStatus::Running.can_transition_to(SagaStatus::Compensated));
        assert!(!SagaStatus::Completed.can_transition_to(SagaStatus::Compensating));
        assert!(!SagaStatus::Failed.can_transition_to(SagaStatus::Running));
    }

    #[test]
    fn test_cannot_skip_ahead() {
        let mut exec = SagaExecution::new(&definition(), Map::new());
        assert!(exec.begin_transaction(1).is_err());
        exec.begin_transaction(0).unwrap();
        assert!(exec.begin_transaction(0).is_err());
        assert!(exec.begin_transaction(1).is_err());
    }

    #[test]
    fn test_complete_merges_object_results() {
        let mut exec = SagaExecution::new(&definition(), Map::new());
        exec.begin_transaction(0).unwrap();
        exec.complete_transaction(0, json!({ "paymentId": "p-1" })).unwrap();
        exec.begin_transaction(1).unwrap();
        exec.complete_transaction(1, json!(7)).unwrap();

        assert_eq!(exec.context.get("paymentId"), Some(&json!("p-1")));
        assert_eq!(exec.context.get("reserve"), Some(&json!(7)));
    }

    #[test]
    fn test_reverse_compensation_plan() {
        let def = definition();
        let mut exec = SagaExecution::new(&def, Map::new());
        for i in 0..2 {
            exec.begin_transaction(i).unwrap();
            exec.complete_transaction(i, Value::Null).unwrap();
        }
        exec.begin_transaction(2).unwrap();
        exec.fail_transaction(2, failure()).unwrap();
        assert_eq!(exec.status, SagaStatus::Compensating);

        let CompensationStep::Run { transaction_index, compensation } = exec.next_compensation(&def) else {
            panic!("expected a compensation to run");
        };
        assert_eq!(transaction_index, 1);
        assert_eq!(compensation.compensation_id, "unreserve");

        exec.begin_compensation(1, "unreserve").unwrap();
        assert_eq!(exec.next_compensation(&def), CompensationStep::InFlight);
        exec.complete_compensation(1, Value::Null).unwrap();
        assert_eq!(exec.transactions[1].status, TransactionStatus::Compensated);

        let CompensationStep::Run { transaction_index, .. } = exec.next_compensation(&def) else {
            panic!("expected a compensation to run");
        };
        assert_eq!(transaction_index, 0);
    }

    #[test]
    fn test_fail_compensation_reports_uncompensated() {
        let def = definition();
        let mut exec = SagaExecution::new(&def, Map::new());
        exec.begin_transaction(0).unwrap();
        exec.complete_transaction(0, Value::Null).unwrap();
        exec.begin_transaction(1).unwrap();
        exec.fail_transaction(1, failure()).unwrap();
        exec.begin_compensation(0, "refund").unwrap();
        exec.fail_compensation(&def, 0, StepError::new(StepErrorCode::CompensationFailed, "nope"))
            .unwrap();

        assert_eq!(exec.status, SagaStatus::Failed);
        assert!(exec.completed_at.is_some());
        let error = exec.error.unwrap();
        assert_eq!(error.code, StepErrorCode::CompensationFailed);
        let details = error.details.unwrap();
        assert_eq!(details["uncompensated"], json!(["debit"]));
        assert_eq!(details["transactionError"]["message"], json!("boom"));
    }

    #[test]
    fn test_reset_interrupted() {
        let mut exec = SagaExecution::new(&definition(), Map::new());
        exec.begin_transaction(0).unwrap();
        assert!(exec.reset_interrupted(Utc::now()));
        assert_eq!(exec.transactions[0].status, TransactionStatus::Pending);
        assert_eq!(exec.transactions[0].retry_count, 1);
        assert!(!exec.reset_interrupted(Utc::now()));
    }

    #[test]
    fn test_reset_leaves_leased_steps_alone() {
        let now = Utc::now();
        let mut exec = SagaExecution::new(&definition(), Map::new());
        exec.begin_transaction(0).unwrap();
        exec.lease_transaction(0, now + chrono::Duration::seconds(30)).unwrap();

        assert!(!exec.reset_interrupted(now));
        assert_eq!(exec.transactions[0].status, TransactionStatus::Running);

        assert!(exec.reset_interrupted(now + chrono::Duration::seconds(31)));
        assert_eq!(exec.transactions[0].status, TransactionStatus::Pending);
        assert!(exec.transactions[0].lease_expires_at.is_none());
    }

    #[test]
    fn test_reset_leaves_leased_compensation_alone() {
        let now = Utc::now();
        let mut exec = SagaExecution::new(&definition(), Map::new());
        exec.begin_transaction(0).unwrap();
        exec.complete_transaction(0, json!(null)).unwrap();
        exec.fail_transaction(1, failure()).unwrap();
        exec.begin_compensation(0, "refund").unwrap();
        exec.lease_compensation(0, now + chrono::Duration::seconds(5)).unwrap();

        assert!(!exec.reset_interrupted(now));
        assert!(exec.reset_interrupted(now + chrono::Duration::seconds(6)));
        assert_eq!(exec.compensations[0].status, CompensationStatus::Pending);
    }

    #[test]
    fn test_stale_attempt_is_rejected() {
        let mut exec = SagaExecution::new(&definition(), Map::new());
        exec.begin_transaction(0).unwrap();
        exec.check_attempt(0, 1).unwrap();

        // Another run took the step over after its lease lapsed.
        exec.reset_interrupted(Utc::now());
        exec.begin_transaction(0).unwrap();

        assert!(matches!(exec.check_attempt(0, 1), Err(Error::InvalidTransition { .. })));
        exec.check_attempt(0, 2).unwrap();
    }

    #[test]
    fn test_saga_timeout_is_strictly_after_deadline() {
        let exec = SagaExecution::new(&definition(), Map::new());
        let timeout = Duration::from_secs(60);
        let deadline = exec.started_at + chrono::Duration::seconds(60);

        assert!(exec.saga_timeout_elapsed(timeout, deadline).is_none());
        assert_eq!(
            exec.saga_timeout_elapsed(timeout, deadline + chrono::Duration::milliseconds(1)),
            Some(Duration::from_millis(60_001))
        );
    }

    #[test]
    fn test_cancel_terminal_rejected() {
        let mut exec = SagaExecution::new(&definition(), Map::new());
        exec.request_cancel().unwrap();
        assert!(exec.cancel_requested);
        exec.status = SagaStatus::Completed;
        assert!(matches!(exec.request_cancel(), Err(Error::ExecutionTerminal { .. })));
    }

    #[test]
    fn test_status_projection_counts() {
        let def = definition();
        let mut exec = SagaExecution::new(&def, Map::new());
        exec.begin_transaction(0).unwrap();
        exec.complete_transaction(0, Value::Null).unwrap();
        let projection = exec.status_projection();
        assert_eq!(projection.transaction_count, 3);
        assert_eq!(projection.completed_count, 1);
        assert_eq!(projection.compensation_count, 0);
    }

    #[test]
    fn test_execution_id_parse() {
        let id = ExecutionId::new();
        let parsed: ExecutionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<ExecutionId>().is_err());
    }
}
