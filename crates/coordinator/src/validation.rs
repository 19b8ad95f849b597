//! Structural validation of saga definitions.
//!
//! Validation runs before anything is persisted and reports every violated
//! rule at once rather than stopping at the first.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::types::SagaDefinition;

/// Minimum number of transactions in a saga.
pub const MIN_TRANSACTIONS: usize = 2;

/// A single violated definition rule.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Violation {
    #[error("saga id must not be empty")]
    EmptySagaId,

    #[error("a saga needs at least 2 transactions, found {count}")]
    TooFewTransactions { count: usize },

    #[error("transaction id '{transaction_id}' is not unique")]
    DuplicateTransactionId { transaction_id: String },

    #[error("compensation id '{compensation_id}' is not unique")]
    DuplicateCompensationId { compensation_id: String },

    #[error("transaction '{transaction_id}' references unknown compensation '{compensation_id}'")]
    DanglingCompensation {
        transaction_id: String,
        compensation_id: String,
    },

    #[error("saga timeout must be positive")]
    NonPositiveSagaTimeout,

    #[error("timeout of step '{step_id}' must be positive")]
    NonPositiveStepTimeout { step_id: String },

    #[error("step '{step_id}' must name a service and an operation")]
    MissingTarget { step_id: String },

    #[error("retry policy of transaction '{transaction_id}' is invalid: {reason}")]
    InvalidRetryPolicy {
        transaction_id: String,
        reason: String,
    },
}

/// Collect every rule the definition violates.
pub fn violations(definition: &SagaDefinition) -> Vec<Violation> {
    let mut found = Vec::new();

    if definition.saga_id.trim().is_empty() {
        found.push(Violation::EmptySagaId);
    }

    if definition.transactions.len() < MIN_TRANSACTIONS {
        found.push(Violation::TooFewTransactions {
            count: definition.transactions.len(),
        });
    }

    if definition.timeout == Duration::ZERO {
        found.push(Violation::NonPositiveSagaTimeout);
    }

    let mut seen = HashSet::new();
    for transaction in &definition.transactions {
        if !seen.insert(transaction.transaction_id.as_str()) {
            found.push(Violation::DuplicateTransactionId {
                transaction_id: transaction.transaction_id.clone(),
            });
        }
    }

    let mut seen = HashSet::new();
    for compensation in &definition.compensations {
        if !seen.insert(compensation.compensation_id.as_str()) {
            found.push(Violation::DuplicateCompensationId {
                compensation_id: compensation.compensation_id.clone(),
            });
        }
    }

    for transaction in &definition.transactions {
        let step_id = &transaction.transaction_id;

        if let Some(compensation_id) = transaction.compensation_id.as_deref() {
            if !compensation_id.is_empty() && !seen.contains(compensation_id) {
                found.push(Violation::DanglingCompensation {
                    transaction_id: step_id.clone(),
                    compensation_id: compensation_id.to_string(),
                });
            }
        }

        if transaction.timeout == Duration::ZERO {
            found.push(Violation::NonPositiveStepTimeout {
                step_id: step_id.clone(),
            });
        }

        if transaction.service_name.trim().is_empty() || transaction.operation.trim().is_empty() {
            found.push(Violation::MissingTarget {
                step_id: step_id.clone(),
            });
        }

        if let Some(policy) = &transaction.retry_policy {
            if policy.max_attempts == 0 {
                found.push(Violation::InvalidRetryPolicy {
                    transaction_id: step_id.clone(),
                    reason: "maxAttempts must be at least 1".to_string(),
                });
            }
            if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
                found.push(Violation::InvalidRetryPolicy {
                    transaction_id: step_id.clone(),
                    reason: "backoffMultiplier must be a finite number >= 1".to_string(),
                });
            }
        }
    }

    for compensation in &definition.compensations {
        let step_id = &compensation.compensation_id;

        if compensation.timeout == Duration::ZERO {
            found.push(Violation::NonPositiveStepTimeout {
                step_id: step_id.clone(),
            });
        }

        if compensation.service_name.trim().is_empty() || compensation.operation.trim().is_empty()
        {
            found.push(Violation::MissingTarget {
                step_id: step_id.clone(),
            });
        }
    }

    found
}

/// Validate a definition.
///
/// # Errors
///
/// Returns [`Error::ValidationFailed`] listing every violated rule.
pub fn validate(definition: &SagaDefinition) -> Result<()> {
    let found = violations(definition);
    if found.is_empty() {
        Ok(())
    } else {
        Err(Error::validation_failed(found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Compensation, RetryPolicy, Transaction};

    fn valid() -> SagaDefinition {
        SagaDefinition::new("order")
            .add_transaction(Transaction::new("debit", "payments", "debit").compensated_by("refund"))
            .add_transaction(Transaction::new("ship", "shipping", "ship"))
            .add_compensation(Compensation::new("refund", "payments", "refund"))
    }

    #[test]
    fn test_valid_definition_passes() {
        assert!(validate(&valid()).is_ok());
    }

    #[test]
    fn test_single_transaction_rejected() {
        let def = SagaDefinition::new("one").add_transaction(Transaction::new("a", "svc", "op"));
        assert_eq!(
            violations(&def),
            vec![Violation::TooFewTransactions { count: 1 }]
        );
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let def = valid().add_transaction(Transaction::new("pack", "wh", "pack").compensated_by("X"));
        assert!(violations(&def).contains(&Violation::DanglingCompensation {
            transaction_id: "pack".to_string(),
            compensation_id: "X".to_string(),
        }));
    }

    #[test]
    fn test_duplicates_rejected() {
        let def = valid()
            .add_transaction(Transaction::new("debit", "payments", "debit"))
            .add_compensation(Compensation::new("refund", "payments", "refund"));
        let found = violations(&def);
        assert!(found.contains(&Violation::DuplicateTransactionId {
            transaction_id: "debit".to_string()
        }));
        assert!(found.contains(&Violation::DuplicateCompensationId {
            compensation_id: "refund".to_string()
        }));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut def = valid().with_timeout(Duration::ZERO);
        def.transactions[1].timeout = Duration::ZERO;
        def.compensations[0].timeout = Duration::ZERO;
        let found = violations(&def);
        assert!(found.contains(&Violation::NonPositiveSagaTimeout));
        assert!(found.contains(&Violation::NonPositiveStepTimeout {
            step_id: "ship".to_string()
        }));
        assert!(found.contains(&Violation::NonPositiveStepTimeout {
            step_id: "refund".to_string()
        }));
    }

    #[test]
    fn test_bad_retry_policy_rejected() {
        let mut def = valid();
        def.transactions[0].retry_policy = Some(RetryPolicy::new(0, Duration::ZERO, 0.5));
        assert_eq!(violations(&def).len(), 2);
    }

    #[test]
    fn test_all_violations_reported_together() {
        let def = SagaDefinition::new("")
            .with_timeout(Duration::ZERO)
            .add_transaction(Transaction::new("a", "", "op").compensated_by("missing"));
        assert_eq!(violations(&def).len(), 5);
    }
}
