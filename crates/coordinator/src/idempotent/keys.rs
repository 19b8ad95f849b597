//! Step idempotency key generation.

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::execution::ExecutionId;
use crate::executor::Direction;
use crate::idempotent::hash::hash_serializable;

#[derive(Serialize)]
struct StepIdentity<'a> {
    step_id: &'a str,
    direction: Direction,
}

/// UUID v5 namespace scoping every key of one execution.
#[must_use]
pub fn namespace_from_execution(execution_id: ExecutionId) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_DNS,
        format!("saga-execution:{execution_id}").as_bytes(),
    )
}

/// Deterministic idempotency key for one step call.
///
/// Retries and post-crash re-invocations of the same step in the same
/// direction get the same key; the forward call and the compensation of a
/// transaction get different keys.
///
/// ```
/// use saga_coordinator::idempotent::step_key;
/// use saga_coordinator::{Direction, ExecutionId};
///
/// let execution_id = ExecutionId::new();
/// let key = step_key(execution_id, "debit", Direction::Forward).unwrap();
/// assert_eq!(key, step_key(execution_id, "debit", Direction::Forward).unwrap());
/// assert_ne!(key, step_key(execution_id, "debit", Direction::Compensate).unwrap());
/// ```
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the step identity cannot be encoded.
pub fn step_key(execution_id: ExecutionId, step_id: &str, direction: Direction) -> Result<Uuid> {
    let namespace = namespace_from_execution(execution_id);
    let hash = hash_serializable(&StepIdentity { step_id, direction })
        .map_err(|e| Error::serialization(e.to_string()))?;
    Ok(Uuid::new_v5(&namespace, &hash))
}
