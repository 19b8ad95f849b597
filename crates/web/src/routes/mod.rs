//! REST API routes
//!
//! ## Route Structure
//!
//! - `GET /health` - Health check endpoint
//! - `POST /sagas` - Register a saga definition
//! - `GET /sagas/{saga_id}` - Fetch a saga definition
//! - `POST /sagas/{saga_id}/executions` - Start and run an execution
//! - `GET /sagas/{saga_id}/executions` - List executions of a saga
//! - `GET /executions/{execution_id}` - Full execution record
//! - `GET /executions/{execution_id}/status` - Status projection
//! - `POST /executions/{execution_id}/resume` - Continue a stopped execution
//! - `POST /executions/{execution_id}/cancel` - Request cancellation
//!
//! Errors are RFC 7807 Problem Details; see [`crate::error`].

use axum::{
    Router,
    routing::{get, post},
};

use super::state::AppState;

pub mod executions;
pub mod health;
pub mod sagas;

/// Create the API router
///
/// # Example
///
/// ```ignore
/// use saga_web::{routes, AppState};
///
/// let router = routes::create_router().with_state(AppState::new(coordinator));
/// ```
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        // Saga definitions
        .route("/sagas", post(sagas::create_saga))
        .route("/sagas/{saga_id}", get(sagas::get_saga))
        .route(
            "/sagas/{saga_id}/executions",
            post(sagas::start_execution).get(sagas::list_executions),
        )
        // Executions
        .route("/executions/{execution_id}", get(executions::get_execution))
        .route("/executions/{execution_id}/status", get(executions::get_status))
        .route("/executions/{execution_id}/resume", post(executions::resume_execution))
        .route("/executions/{execution_id}/cancel", post(executions::cancel_execution))
}
