//! Saga coordinator for ordered remote transactions with compensation.
//!
//! A saga is an ordered list of transactions against independent services.
//! The coordinator runs them one at a time; when one fails it runs the
//! compensations of the already completed transactions in reverse order.
//!
//! - **Persisted state machine**: every transition is written to a
//!   [`SagaStore`] before the next remote call, with compare-and-swap on a
//!   record revision.
//! - **Resumable**: an execution cut off by a crash continues from its last
//!   persisted state, without re-invoking completed steps.
//! - **Idempotency keys**: each remote call carries a UUID v5 key that is
//!   stable across retries and re-invocations.
//! - **Retry policy**: recoverable transaction failures are retried with
//!   exponential backoff. Compensations are never retried.
//! - **Lifecycle events**: start and terminal transitions are published
//!   through an [`EventPublisher`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use saga_coordinator::{
//!     Compensation, CoordinatorConfig, InMemorySagaStore, InvokerRegistry, NoOpInvoker,
//!     SagaCoordinator, SagaDefinition, Transaction,
//! };
//!
//! #[tokio::main]
//! async fn main() -> saga_coordinator::Result<()> {
//!     let invokers = InvokerRegistry::with_fallback(Arc::new(NoOpInvoker::new("noop")));
//!     let coordinator = SagaCoordinator::new(
//!         Arc::new(InMemorySagaStore::new()),
//!         Arc::new(invokers),
//!         CoordinatorConfig::default(),
//!     );
//!
//!     coordinator
//!         .create_saga(
//!             &SagaDefinition::new("order")
//!                 .add_transaction(Transaction::new("debit", "payments", "debit").compensated_by("refund"))
//!                 .add_transaction(Transaction::new("ship", "shipping", "ship"))
//!                 .add_compensation(Compensation::new("refund", "payments", "refund")),
//!         )
//!         .await?;
//!
//!     let execution = coordinator.start_saga("order", Default::default()).await?;
//!     println!("saga finished as {}", execution.status);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod events;
pub mod execution;
pub mod executor;
pub mod idempotent;
pub mod storage;
pub mod surreal;
pub mod types;
pub mod validation;

// Re-export main types
pub use config::{CoordinatorConfig, SimulationConfig};
pub use coordinator::SagaCoordinator;
pub use definition::DefinitionStore;
pub use error::{Error, Result};
pub use events::{
    BroadcastPublisher, EventPublisher, FailingPublisher, NoOpPublisher, RecordingPublisher,
    SagaEvent, SagaEventKind,
};
pub use execution::{
    CompensationExecution, CompensationStatus, ExecutionId, SagaExecution, SagaStatus,
    StatusProjection, StepError, StepErrorCode, TransactionExecution, TransactionStatus,
};
pub use executor::{
    CompensationExecutor, Direction, FailingInvoker, FnInvoker, InvokerRegistry, NoOpInvoker,
    SimulatedInvoker, StepInvoker, StepRequest, TransactionExecutor,
};
pub use storage::{ExecutionFilter, InMemorySagaStore, RecordKey, SagaStore};
pub use surreal::{StoreConfig, SurrealSagaStore};
pub use types::{Compensation, InputTemplate, RetryPolicy, SagaDefinition, Transaction};
pub use validation::{validate, Violation};
