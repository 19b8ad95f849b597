//! SurrealDB-backed saga store.
//!
//! Every record lives in one table. The record id is the composite
//! `partition/kind#id` key, and the domain object is kept as a JSON body
//! next to the few columns needed for filtering and compare-and-swap.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::sql::Thing;
use surrealdb::Surreal;
use tracing::debug;

use crate::error::{Error, Result};
use crate::execution::{ExecutionId, SagaExecution};
use crate::storage::{check_write, ExecutionFilter, RecordKey, SagaStore};
use crate::types::SagaDefinition;

const TABLE: &str = "saga_record";

/// Configuration for the SurrealDB store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL (e.g., "mem://", "rocksdb://data/sagas", "ws://localhost:8000")
    pub url: String,
    pub namespace: String,
    pub database: String,
    /// Optional root credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Root credentials for authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl StoreConfig {
    /// Create an in-memory configuration for testing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "saga".to_string(),
            database: "test".to_string(),
            credentials: None,
        }
    }

    /// Set the connection URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set credentials for authentication.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordKind {
    Definition,
    Execution,
}

/// Row stored in the saga table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SagaRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    partition: String,
    kind: RecordKind,
    saga_id: String,
    revision: u64,
    terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    /// Serialized domain object as JSON
    body: String,
    created_at: DateTime<Utc>,
    /// Listing sort key: `created_at` in microseconds since the epoch.
    created_micros: i64,
    updated_at: DateTime<Utc>,
}

impl SagaRecord {
    fn from_definition(partition: &str, definition: &SagaDefinition) -> Result<Self> {
        let created_at = definition.created_at.unwrap_or_else(Utc::now);
        Ok(Self {
            id: None,
            partition: partition.to_string(),
            kind: RecordKind::Definition,
            saga_id: definition.saga_id.clone(),
            revision: 1,
            terminal: false,
            status: None,
            body: serde_json::to_string(definition)?,
            created_at,
            created_micros: created_at.timestamp_micros(),
            updated_at: created_at,
        })
    }

    fn from_execution(partition: &str, execution: &SagaExecution) -> Result<Self> {
        Ok(Self {
            id: None,
            partition: partition.to_string(),
            kind: RecordKind::Execution,
            saga_id: execution.saga_id.clone(),
            revision: execution.revision,
            terminal: execution.status.is_terminal(),
            status: Some(execution.status.to_string()),
            body: serde_json::to_string(execution)?,
            created_at: execution.started_at,
            created_micros: execution.started_at.timestamp_micros(),
            updated_at: execution.updated_at,
        })
    }

    fn definition(&self) -> Result<SagaDefinition> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Decode the execution body, taking the revision from the row.
    fn execution(&self) -> Result<SagaExecution> {
        let mut execution: SagaExecution = serde_json::from_str(&self.body)?;
        execution.revision = self.revision;
        Ok(execution)
    }
}

fn storage_error(operation: &'static str) -> impl FnOnce(surrealdb::Error) -> Error {
    move |err| Error::storage(operation, err.to_string())
}

/// Saga store persisted in SurrealDB.
#[derive(Debug, Clone)]
pub struct SurrealSagaStore {
    db: Arc<Surreal<Any>>,
    config: StoreConfig,
}

impl SurrealSagaStore {
    /// Connect to the database with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or authentication fails.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let db = Surreal::<Any>::init();

        db.connect(&config.url).await.map_err(storage_error("connect"))?;

        if let Some(creds) = &config.credentials {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(storage_error("signin"))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(storage_error("use_db"))?;

        debug!(url = %config.url, namespace = %config.namespace, database = %config.database, "Connected saga store");

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    /// Get the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn record_id(key: &RecordKey) -> String {
        key.to_string()
    }

    async fn select(&self, key: &RecordKey) -> Result<Option<SagaRecord>> {
        self.db
            .select((TABLE, Self::record_id(key)))
            .await
            .map_err(storage_error("select"))
    }
}

#[async_trait]
impl SagaStore for SurrealSagaStore {
    async fn create_definition(
        &self,
        partition: &str,
        definition: &SagaDefinition,
    ) -> Result<SagaDefinition> {
        let mut stored = definition.clone();
        stored.created_at = Some(Utc::now());
        let record = SagaRecord::from_definition(partition, &stored)?;
        let key = RecordKey::definition(partition, &definition.saga_id);

        let created: Option<SagaRecord> = self
            .db
            .create((TABLE, Self::record_id(&key)))
            .content(record)
            .await
            .map_err(|err| {
                if err.to_string().contains("already exists") {
                    Error::already_exists(&definition.saga_id)
                } else {
                    Error::storage("create_definition", err.to_string())
                }
            })?;

        created
            .ok_or_else(|| Error::storage("create_definition", "no record returned"))?
            .definition()
    }

    async fn load_definition(
        &self,
        partition: &str,
        saga_id: &str,
    ) -> Result<Option<SagaDefinition>> {
        self.select(&RecordKey::definition(partition, saga_id))
            .await?
            .filter(|r| r.kind == RecordKind::Definition)
            .map(|r| r.definition())
            .transpose()
    }

    async fn create_execution(
        &self,
        partition: &str,
        execution: &SagaExecution,
    ) -> Result<SagaExecution> {
        let mut stored = execution.clone();
        stored.revision = 1;
        let record = SagaRecord::from_execution(partition, &stored)?;
        let key = RecordKey::execution(partition, execution.execution_id);

        let created: Option<SagaRecord> = self
            .db
            .create((TABLE, Self::record_id(&key)))
            .content(record)
            .await
            .map_err(storage_error("create_execution"))?;

        created
            .ok_or_else(|| Error::storage("create_execution", "no record returned"))?
            .execution()
    }

    async fn save_execution(
        &self,
        partition: &str,
        execution: &SagaExecution,
    ) -> Result<SagaExecution> {
        let key = RecordKey::execution(partition, execution.execution_id);
        let mut next = execution.clone();
        next.revision = execution.revision.saturating_add(1);
        let record = SagaRecord::from_execution(partition, &next)?;

        let updated: Vec<SagaRecord> = self
            .db
            .query(
                "UPDATE type::thing($table, $id) \
                 SET body = $body, revision = $next, status = $status, terminal = $terminal, updated_at = $updated_at \
                 WHERE revision = $expected AND terminal = false \
                 RETURN AFTER",
            )
            .bind(("table", TABLE))
            .bind(("id", Self::record_id(&key)))
            .bind(("body", record.body))
            .bind(("next", next.revision))
            .bind(("status", record.status))
            .bind(("terminal", record.terminal))
            .bind(("updated_at", record.updated_at))
            .bind(("expected", execution.revision))
            .await
            .map_err(storage_error("save_execution"))?
            .take(0)
            .map_err(storage_error("save_execution"))?;

        if let Some(row) = updated.into_iter().next() {
            return row.execution();
        }

        // Nothing matched: find out why.
        let current = self
            .select(&key)
            .await?
            .ok_or_else(|| Error::execution_not_found(execution.execution_id))?
            .execution()?;
        check_write(&current, execution)?;
        Err(Error::storage(
            "save_execution",
            format!("update of {key} matched no record"),
        ))
    }

    async fn load_execution(
        &self,
        partition: &str,
        execution_id: ExecutionId,
    ) -> Result<Option<SagaExecution>> {
        self.select(&RecordKey::execution(partition, execution_id))
            .await?
            .filter(|r| r.kind == RecordKind::Execution)
            .map(|r| r.execution())
            .transpose()
    }

    async fn list_executions(
        &self,
        partition: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<SagaExecution>> {
        let mut sql = String::from(
            "SELECT * FROM type::table($table) WHERE partition = $partition AND kind = 'execution'",
        );
        if filter.saga_id.is_some() {
            sql.push_str(" AND saga_id = $saga_id");
        }
        if filter.incomplete_only {
            sql.push_str(" AND terminal = false");
        }
        sql.push_str(" ORDER BY created_micros ASC, id ASC");

        let mut query = self
            .db
            .query(sql)
            .bind(("table", TABLE))
            .bind(("partition", partition.to_string()));
        if let Some(saga_id) = &filter.saga_id {
            query = query.bind(("saga_id", saga_id.clone()));
        }

        let rows: Vec<SagaRecord> = query
            .await
            .map_err(storage_error("list_executions"))?
            .take(0)
            .map_err(storage_error("list_executions"))?;

        rows.iter().map(SagaRecord::execution).collect()
    }

    async fn health_check(&self) -> Result<()> {
        self.db
            .query("INFO FOR DB")
            .await
            .map_err(storage_error("health_check"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_store_config_in_memory() {
        let config = StoreConfig::in_memory();
        assert_eq!(config.url, "mem://");
        assert_eq!(config.namespace, "saga");
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_store_config_builders() {
        let config = StoreConfig::in_memory()
            .with_url("rocksdb://data/sagas")
            .with_database("prod")
            .with_credentials("root", "secret");
        assert_eq!(config.url, "rocksdb://data/sagas");
        assert_eq!(config.database, "prod");
        assert_eq!(config.credentials.unwrap().username, "root");
    }
}
