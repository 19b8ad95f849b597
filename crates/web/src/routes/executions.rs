//! Execution endpoints

use std::str::FromStr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use saga_coordinator::{ExecutionId, SagaExecution, StatusProjection};

use super::super::error::{AppError, Result};
use super::super::state::AppState;

fn parse_execution_id(raw: &str) -> Result<ExecutionId> {
    ExecutionId::from_str(raw)
        .map_err(|e| AppError::BadRequest(format!("invalid execution id '{raw}': {e}")))
}

/// GET /executions/{execution_id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<SagaExecution>> {
    let id = parse_execution_id(&execution_id)?;
    Ok(Json(state.coordinator.get_execution(id).await?))
}

/// GET /executions/{execution_id}/status
pub async fn get_status(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<StatusProjection>> {
    let id = parse_execution_id(&execution_id)?;
    Ok(Json(state.coordinator.get_status(id).await?))
}

/// POST /executions/{execution_id}/resume
///
/// A terminal execution comes back unchanged.
pub async fn resume_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<SagaExecution>> {
    let id = parse_execution_id(&execution_id)?;
    Ok(Json(state.coordinator.resume(id).await?))
}

/// POST /executions/{execution_id}/cancel
///
/// Only records the request. The running drive loop acts on it before its
/// next transaction, so the answer is 202.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<(StatusCode, Json<SagaExecution>)> {
    let id = parse_execution_id(&execution_id)?;
    let execution = state.coordinator.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}
