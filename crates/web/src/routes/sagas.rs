//! Saga definition endpoints

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use saga_coordinator::{ExecutionFilter, SagaDefinition, SagaExecution};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::super::error::Result;
use super::super::state::AppState;

/// Request payload for starting an execution
#[derive(Debug, Default, Deserialize)]
pub struct StartExecutionRequest {
    /// Initial context; empty when omitted.
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// POST /sagas - Register a saga definition
pub async fn create_saga(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SagaDefinition>, JsonRejection>,
) -> Result<(StatusCode, Json<SagaDefinition>)> {
    let Json(definition) = payload?;
    let stored = state.coordinator.create_saga(&definition).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /sagas/{saga_id}
pub async fn get_saga(
    State(state): State<AppState>,
    Path(saga_id): Path<String>,
) -> Result<Json<SagaDefinition>> {
    Ok(Json(state.coordinator.get_definition(&saga_id).await?))
}

/// POST /sagas/{saga_id}/executions - Run a new execution to its end
///
/// Answers 201 with the final record whether the saga completed, was
/// compensated, or failed. The outcome is in `status`.
pub async fn start_execution(
    State(state): State<AppState>,
    Path(saga_id): Path<String>,
    payload: std::result::Result<Json<StartExecutionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SagaExecution>)> {
    let Json(request) = payload?;
    let execution = state
        .coordinator
        .start_saga(&saga_id, request.context)
        .await?;
    debug!(execution_id = %execution.execution_id, status = %execution.status, "Execution finished");
    Ok((StatusCode::CREATED, Json(execution)))
}

/// GET /sagas/{saga_id}/executions
pub async fn list_executions(
    State(state): State<AppState>,
    Path(saga_id): Path<String>,
) -> Result<Json<Vec<SagaExecution>>> {
    state.coordinator.get_definition(&saga_id).await?;
    let executions = state
        .coordinator
        .list_executions(&ExecutionFilter::all().with_saga(saga_id))
        .await?;
    Ok(Json(executions))
}
