//! Health check endpoint: GET /health

use axum::{extract::State, response::Json};
use serde::Serialize;

use super::super::error::{AppError, Result};
use super::super::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

/// GET /health - reports 503 when the store is unreachable
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    state
        .coordinator
        .health()
        .await
        .map_err(|err| AppError::ServiceUnavailable(err.to_string()))?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
