//! Error types for the saga coordinator.
//!
//! Structural errors (bad definitions, lookup misses, storage faults) surface
//! as [`Error`]. Failures of the business workflow itself are captured as
//! [`StepError`](crate::execution::StepError) on the execution record and
//! never escape the coordinator as `Err`.

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

use crate::validation::Violation;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coordinator error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The saga definition violates one or more structural rules.
    #[error("saga definition rejected: {}", format_violations(.violations))]
    ValidationFailed { violations: Vec<Violation> },

    /// A definition with this saga id already exists.
    #[error("saga '{saga_id}' already exists")]
    AlreadyExists { saga_id: String },

    /// No definition with this saga id.
    #[error("saga '{saga_id}' not found")]
    SagaNotFound { saga_id: String },

    /// No execution with this id.
    #[error("execution '{execution_id}' not found")]
    ExecutionNotFound { execution_id: String },

    /// A status change that the state machine does not allow.
    #[error("invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// The execution already reached a terminal status.
    #[error("execution '{execution_id}' is terminal ({status}) and cannot change")]
    ExecutionTerminal {
        execution_id: String,
        status: String,
    },

    /// The stored revision moved on since the caller read the record.
    #[error("execution '{execution_id}' was modified concurrently (expected revision {expected}, found {found})")]
    Conflict {
        execution_id: String,
        expected: u64,
        found: u64,
    },

    /// Storage operation failed.
    #[error("storage operation '{operation}' failed: {reason}")]
    Storage { operation: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Event publication failed.
    #[error("event publication failed: {reason}")]
    Publish { reason: String },
}

fn format_violations(violations: &[Violation]) -> String {
    violations.iter().map(ToString::to_string).join("; ")
}

impl Error {
    /// Create a validation failed error.
    pub fn validation_failed(violations: Vec<Violation>) -> Self {
        Self::ValidationFailed { violations }
    }

    /// Create an already exists error.
    pub fn already_exists(saga_id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            saga_id: saga_id.into(),
        }
    }

    /// Create a saga not found error.
    pub fn saga_not_found(saga_id: impl Into<String>) -> Self {
        Self::SagaNotFound {
            saga_id: saga_id.into(),
        }
    }

    /// Create an execution not found error.
    pub fn execution_not_found(execution_id: impl fmt::Display) -> Self {
        Self::ExecutionNotFound {
            execution_id: execution_id.to_string(),
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an execution terminal error.
    pub fn execution_terminal(execution_id: impl fmt::Display, status: impl fmt::Display) -> Self {
        Self::ExecutionTerminal {
            execution_id: execution_id.to_string(),
            status: status.to_string(),
        }
    }

    /// Create a revision conflict error.
    pub fn conflict(execution_id: impl fmt::Display, expected: u64, found: u64) -> Self {
        Self::Conflict {
            execution_id: execution_id.to_string(),
            expected,
            found,
        }
    }

    /// Create a storage failed error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create a publish error.
    pub fn publish(reason: impl Into<String>) -> Self {
        Self::Publish {
            reason: reason.into(),
        }
    }

    /// Check if this error is a lookup miss.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SagaNotFound { .. } | Self::ExecutionNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
