//! Saga lifecycle events.
//!
//! Events are fire-and-forget: the coordinator logs publish failures and
//! carries on.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::execution::{ExecutionId, SagaExecution, SagaStatus, StepError};

/// Lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaEventKind {
    SagaStarted,
    SagaCompleted,
    SagaCompensated,
    SagaFailed,
}

impl SagaEventKind {
    /// Event announcing that an execution reached `status`, if it is terminal.
    pub const fn for_terminal(status: SagaStatus) -> Option<Self> {
        match status {
            SagaStatus::Completed => Some(Self::SagaCompleted),
            SagaStatus::Compensated => Some(Self::SagaCompensated),
            SagaStatus::Failed => Some(Self::SagaFailed),
            SagaStatus::Running | SagaStatus::Compensating => None,
        }
    }
}

impl std::fmt::Display for SagaEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SagaStarted => "SagaStarted",
            Self::SagaCompleted => "SagaCompleted",
            Self::SagaCompensated => "SagaCompensated",
            Self::SagaFailed => "SagaFailed",
        };
        write!(f, "{s}")
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaEvent {
    pub kind: SagaEventKind,
    pub execution_id: ExecutionId,
    pub saga_id: String,
    pub status: SagaStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub timestamp: DateTime<Utc>,
}

impl SagaEvent {
    /// Build an event from the current state of an execution.
    pub fn new(kind: SagaEventKind, execution: &SagaExecution) -> Self {
        Self {
            kind,
            execution_id: execution.execution_id,
            saga_id: execution.saga_id.clone(),
            status: execution.status,
            error: execution.error.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Trait for lifecycle event sinks.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: SagaEvent) -> Result<()>;
}

/// Publisher that fans events out over a tokio broadcast channel.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<SagaEvent>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SagaEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: SagaEvent) -> Result<()> {
        // No subscribers is not a failure.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Publisher that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPublisher;

#[async_trait]
impl EventPublisher for NoOpPublisher {
    async fn publish(&self, _event: SagaEvent) -> Result<()> {
        Ok(())
    }
}

/// Publisher that keeps every event in memory (for testing).
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<SagaEvent>>,
}

impl RecordingPublisher {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<SagaEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Kinds of the recorded events, in publish order.
    pub fn kinds(&self) -> Vec<SagaEventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: SagaEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| Error::publish("recorder lock poisoned"))?
            .push(event);
        Ok(())
    }
}

/// Publisher whose channel is always down (for testing).
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, event: SagaEvent) -> Result<()> {
        Err(Error::publish(format!("channel unavailable for {}", event.kind)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{SagaDefinition, Transaction};
    use serde_json::Map;

    fn execution() -> SagaExecution {
        let def = SagaDefinition::new("order")
            .add_transaction(Transaction::new("a", "svc", "a"))
            .add_transaction(Transaction::new("b", "svc", "b"));
        SagaExecution::new(&def, Map::new())
    }

    #[test]
    fn test_terminal_kinds() {
        assert_eq!(
            SagaEventKind::for_terminal(SagaStatus::Compensated),
            Some(SagaEventKind::SagaCompensated)
        );
        assert_eq!(SagaEventKind::for_terminal(SagaStatus::Compensating), None);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::default();
        publisher
            .publish(SagaEvent::new(SagaEventKind::SagaStarted, &execution()))
            .await
            .unwrap();

        let mut rx = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);
        let exec = execution();
        publisher
            .publish(SagaEvent::new(SagaEventKind::SagaStarted, &exec))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id, exec.execution_id);
        assert_eq!(event.saga_id, "order");
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = SagaEvent::new(SagaEventKind::SagaFailed, &execution());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "SagaFailed");
        assert!(value.get("executionId").is_some());
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_recording_and_failing_publishers() {
        let recorder = RecordingPublisher::new();
        recorder
            .publish(SagaEvent::new(SagaEventKind::SagaStarted, &execution()))
            .await
            .unwrap();
        assert_eq!(recorder.kinds(), vec![SagaEventKind::SagaStarted]);

        let failing = FailingPublisher;
        assert!(failing
            .publish(SagaEvent::new(SagaEventKind::SagaStarted, &execution()))
            .await
            .is_err());
    }
}
