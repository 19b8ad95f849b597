//! Storage traits for saga persistence.
//!
//! Definitions and executions share one keyspace addressed by a composite
//! [`RecordKey`]: a partition plus a kind-prefixed record id
//! (`SAGA#<sagaId>` or `EXECUTION#<executionId>`).
//!
//! Execution writes are compare-and-swap on [`SagaExecution::revision`] so
//! that two coordinator instances driving the same execution cannot
//! silently overwrite each other, and a record that reached a terminal
//! status is never written again.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::execution::{ExecutionId, SagaExecution};
use crate::types::SagaDefinition;

const DEFINITION_PREFIX: &str = "SAGA#";
const EXECUTION_PREFIX: &str = "EXECUTION#";

/// Composite storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub partition: String,
    pub id: String,
}

impl RecordKey {
    /// Key of a saga definition.
    pub fn definition(partition: impl Into<String>, saga_id: &str) -> Self {
        Self {
            partition: partition.into(),
            id: format!("{DEFINITION_PREFIX}{saga_id}"),
        }
    }

    /// Key of a saga execution.
    pub fn execution(partition: impl Into<String>, execution_id: ExecutionId) -> Self {
        Self {
            partition: partition.into(),
            id: format!("{EXECUTION_PREFIX}{execution_id}"),
        }
    }

    /// Check if this key addresses an execution record.
    pub fn is_execution(&self) -> bool {
        self.id.starts_with(EXECUTION_PREFIX)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition, self.id)
    }
}

/// Filter for execution listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    /// Only executions of this saga.
    pub saga_id: Option<String>,
    /// Only executions that have not reached a terminal status.
    pub incomplete_only: bool,
}

impl ExecutionFilter {
    /// Match every execution.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match executions of one saga.
    #[must_use]
    pub fn with_saga(mut self, saga_id: impl Into<String>) -> Self {
        self.saga_id = Some(saga_id.into());
        self
    }

    /// Match only non-terminal executions.
    #[must_use]
    pub const fn incomplete(mut self) -> Self {
        self.incomplete_only = true;
        self
    }

    /// Check if an execution passes the filter.
    pub fn matches(&self, execution: &SagaExecution) -> bool {
        self.saga_id
            .as_deref()
            .is_none_or(|saga_id| execution.saga_id == saga_id)
            && !(self.incomplete_only && execution.status.is_terminal())
    }
}

/// Trait for saga storage backends.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Store a definition unless one with the same id exists.
    ///
    /// Returns the stored copy with `created_at` set.
    async fn create_definition(
        &self,
        partition: &str,
        definition: &SagaDefinition,
    ) -> Result<SagaDefinition>;

    /// Load a definition by saga id.
    async fn load_definition(&self, partition: &str, saga_id: &str)
        -> Result<Option<SagaDefinition>>;

    /// Store a new execution at revision 1.
    async fn create_execution(
        &self,
        partition: &str,
        execution: &SagaExecution,
    ) -> Result<SagaExecution>;

    /// Overwrite an execution if its stored revision still equals
    /// `execution.revision`. Returns the stored copy at the next revision.
    async fn save_execution(
        &self,
        partition: &str,
        execution: &SagaExecution,
    ) -> Result<SagaExecution>;

    /// Load an execution by id.
    async fn load_execution(
        &self,
        partition: &str,
        execution_id: ExecutionId,
    ) -> Result<Option<SagaExecution>>;

    /// List executions matching the filter, oldest first.
    async fn list_executions(
        &self,
        partition: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<SagaExecution>>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Check whether `incoming` may replace `stored`.
///
/// # Errors
///
/// Returns [`Error::ExecutionTerminal`] if the stored record is terminal, or
/// [`Error::Conflict`] if the revisions differ.
pub fn check_write(stored: &SagaExecution, incoming: &SagaExecution) -> Result<()> {
    if stored.status.is_terminal() {
        return Err(Error::execution_terminal(stored.execution_id, stored.status));
    }
    if stored.revision != incoming.revision {
        return Err(Error::conflict(
            stored.execution_id,
            incoming.revision,
            stored.revision,
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum StoredRecord {
    Definition(SagaDefinition),
    Execution(SagaExecution),
}

/// In-memory storage implementation for tests and single-process use.
#[derive(Default)]
pub struct InMemorySagaStore {
    records: RwLock<HashMap<RecordKey, StoredRecord>>,
}

impl InMemorySagaStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create_definition(
        &self,
        partition: &str,
        definition: &SagaDefinition,
    ) -> Result<SagaDefinition> {
        let key = RecordKey::definition(partition, &definition.saga_id);
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(Error::already_exists(&definition.saga_id));
        }
        let mut stored = definition.clone();
        stored.created_at = Some(Utc::now());
        records.insert(key, StoredRecord::Definition(stored.clone()));
        Ok(stored)
    }

    async fn load_definition(
        &self,
        partition: &str,
        saga_id: &str,
    ) -> Result<Option<SagaDefinition>> {
        let key = RecordKey::definition(partition, saga_id);
        Ok(match self.records.read().await.get(&key) {
            Some(StoredRecord::Definition(definition)) => Some(definition.clone()),
            _ => None,
        })
    }

    async fn create_execution(
        &self,
        partition: &str,
        execution: &SagaExecution,
    ) -> Result<SagaExecution> {
        let key = RecordKey::execution(partition, execution.execution_id);
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(Error::storage(
                "create_execution",
                format!("execution {} already exists", execution.execution_id),
            ));
        }
        let mut stored = execution.clone();
        stored.revision = 1;
        records.insert(key, StoredRecord::Execution(stored.clone()));
        Ok(stored)
    }

    async fn save_execution(
        &self,
        partition: &str,
        execution: &SagaExecution,
    ) -> Result<SagaExecution> {
        let key = RecordKey::execution(partition, execution.execution_id);
        let mut records = self.records.write().await;
        let Some(StoredRecord::Execution(current)) = records.get(&key) else {
            return Err(Error::execution_not_found(execution.execution_id));
        };
        check_write(current, execution)?;
        let mut stored = execution.clone();
        stored.revision = current.revision.saturating_add(1);
        records.insert(key, StoredRecord::Execution(stored.clone()));
        Ok(stored)
    }

    async fn load_execution(
        &self,
        partition: &str,
        execution_id: ExecutionId,
    ) -> Result<Option<SagaExecution>> {
        let key = RecordKey::execution(partition, execution_id);
        Ok(match self.records.read().await.get(&key) {
            Some(StoredRecord::Execution(execution)) => Some(execution.clone()),
            _ => None,
        })
    }

    async fn list_executions(
        &self,
        partition: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<SagaExecution>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.partition == partition)
            .filter_map(|(_, record)| match record {
                StoredRecord::Execution(execution) if filter.matches(execution) => {
                    Some(execution.clone())
                }
                _ => None,
            })
            .sorted_by_key(|e| (e.started_at, e.execution_id))
            .collect_vec())
    }
}
