//! Property-based tests for saga ordering and definition validation.
//!
//! Uses proptest to validate:
//! - Compensations run for exactly the completed, compensable prefix, in
//!   strictly descending order
//! - Forward transactions start only after their predecessor completed
//! - Malformed definitions are rejected and never persisted

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use std::time::Duration;

use common::{coordinator, ScriptedInvoker};
use proptest::prelude::*;
use saga_coordinator::{
    Compensation, Direction, SagaDefinition, SagaStatus, SagaStore, Transaction,
    TransactionStatus,
};
use serde_json::Map;

fn definition(compensable: &[bool]) -> SagaDefinition {
    compensable
        .iter()
        .enumerate()
        .fold(SagaDefinition::new("prop"), |def, (i, has_comp)| {
            let tx = Transaction::new(format!("t{i}"), "svc", format!("op{i}"));
            if *has_comp {
                def.add_transaction(tx.compensated_by(format!("c{i}")))
                    .add_compensation(Compensation::new(format!("c{i}"), "svc", format!("undo{i}")))
            } else {
                def.add_transaction(tx)
            }
        })
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map(|rt| rt.block_on(future))
        .map_err(|e| TestCaseError::fail(e.to_string()))
}

proptest! {
    /// Property: when t_k fails, every completed t_j (j < k) that has a
    /// compensation is compensated, in descending j order.
    #[test]
    fn prop_reverse_compensation_order(
        compensable in prop::collection::vec(any::<bool>(), 2..7),
        fail_seed in any::<prop::sample::Index>(),
    ) {
        let k = fail_seed.index(compensable.len());
        let invoker = ScriptedInvoker::new().fail(&format!("t{k}"));
        let (coordinator, _) = coordinator(invoker.clone());

        let execution = block_on(async {
            coordinator.create_saga(&definition(&compensable)).await?;
            coordinator.start_saga("prop", Map::new()).await
        })?
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let expected: Vec<String> = (0..k)
            .rev()
            .filter(|j| compensable[*j])
            .map(|j| format!("c{j}"))
            .collect();
        prop_assert_eq!(invoker.step_ids_in(Direction::Compensate), expected);
        prop_assert_eq!(execution.status, SagaStatus::Compensated);

        for (j, tx) in execution.transactions.iter().enumerate() {
            let want = match j {
                j if j < k && compensable[j] => TransactionStatus::Compensated,
                j if j < k => TransactionStatus::Completed,
                j if j == k => TransactionStatus::Failed,
                _ => TransactionStatus::Pending,
            };
            prop_assert_eq!(tx.status, want);
        }
    }

    /// Property: forward calls form the in-order prefix t0..=tk; nothing
    /// after a failure is started.
    #[test]
    fn prop_forward_calls_are_an_ordered_prefix(
        len in 2usize..7,
        fail_seed in proptest::option::of(any::<prop::sample::Index>()),
    ) {
        let fail_at = fail_seed.map(|s| s.index(len));
        let invoker = match fail_at {
            Some(k) => ScriptedInvoker::new().fail(&format!("t{k}")),
            None => ScriptedInvoker::new(),
        };
        let (coordinator, _) = coordinator(invoker.clone());

        let execution = block_on(async {
            coordinator.create_saga(&definition(&vec![true; len])).await?;
            coordinator.start_saga("prop", Map::new()).await
        })?
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let last = fail_at.map_or(len - 1, |k| k);
        let expected: Vec<String> = (0..=last).map(|i| format!("t{i}")).collect();
        prop_assert_eq!(invoker.step_ids_in(Direction::Forward), expected);
        let want = if fail_at.is_some() { SagaStatus::Compensated } else { SagaStatus::Completed };
        prop_assert_eq!(execution.status, want);
    }

    /// Property: a definition with any structural defect is rejected and
    /// leaves no record behind.
    #[test]
    fn prop_malformed_definitions_not_persisted(
        len in 0usize..5,
        defect in 0u8..4,
    ) {
        let mut def = definition(&vec![true; len.max(2)]);
        match defect {
            0 => def.transactions.truncate(len.min(1)),
            1 => {
                let dup = def.transactions[0].clone();
                def.transactions.push(dup);
            }
            2 => def.transactions[0].compensation_id = Some("missing".to_string()),
            _ => def.transactions[0].timeout = Duration::ZERO,
        }

        let (coordinator, store) = coordinator(ScriptedInvoker::new());
        let (created, stored) = block_on(async {
            let created = coordinator.create_saga(&def).await;
            let stored = store.load_definition("default", "prop").await;
            (created, stored)
        })?;

        prop_assert!(created.is_err());
        prop_assert!(matches!(stored, Ok(None)));
    }
}
