//! Definition store: validated, create-once saga definitions.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::SagaStore;
use crate::types::SagaDefinition;
use crate::validation::validate;

/// Validating front of the definition records in a [`SagaStore`].
#[derive(Clone)]
pub struct DefinitionStore {
    store: Arc<dyn SagaStore>,
    partition: String,
}

impl DefinitionStore {
    /// Create a definition store over one partition.
    pub fn new(store: Arc<dyn SagaStore>, partition: impl Into<String>) -> Self {
        Self {
            store,
            partition: partition.into(),
        }
    }

    /// Validate and persist a new definition.
    ///
    /// Nothing is written unless every rule passes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationFailed`] for a malformed definition or
    /// [`Error::AlreadyExists`] if the saga id is taken.
    pub async fn create(&self, definition: &SagaDefinition) -> Result<SagaDefinition> {
        if let Err(err) = validate(definition) {
            debug!(saga_id = %definition.saga_id, error = %err, "Rejected saga definition");
            return Err(err);
        }

        let stored = self
            .store
            .create_definition(&self.partition, definition)
            .await?;

        info!(
            saga_id = %stored.saga_id,
            transactions = stored.transactions.len(),
            compensations = stored.compensations.len(),
            "Created saga definition"
        );
        Ok(stored)
    }

    /// Get a definition by saga id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SagaNotFound`] if no such definition exists.
    pub async fn get(&self, saga_id: &str) -> Result<SagaDefinition> {
        self.store
            .load_definition(&self.partition, saga_id)
            .await?
            .ok_or_else(|| Error::saga_not_found(saga_id))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::storage::InMemorySagaStore;
    use crate::types::{Compensation, Transaction};

    fn store() -> DefinitionStore {
        DefinitionStore::new(Arc::new(InMemorySagaStore::new()), "test")
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let definitions = store();
        let def = SagaDefinition::new("order")
            .add_transaction(Transaction::new("debit", "payments", "debit").compensated_by("refund"))
            .add_transaction(Transaction::new("ship", "shipping", "ship"))
            .add_compensation(Compensation::new("refund", "payments", "refund"));

        let created = definitions.create(&def).await.unwrap();
        assert!(created.created_at.is_some());
        assert_eq!(definitions.get("order").await.unwrap(), created);
        assert!(matches!(
            definitions.create(&def).await,
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_definition_not_persisted() {
        let definitions = store();
        let def = SagaDefinition::new("lonely").add_transaction(Transaction::new("a", "svc", "a"));
        assert!(matches!(
            definitions.create(&def).await,
            Err(Error::ValidationFailed { .. })
        ));
        assert!(definitions.get("lonely").await.unwrap_err().is_not_found());
    }
}
