//! Saga coordinator HTTP API
//!
//! Exposes the coordinator's operations as JSON over HTTP, with tower
//! middleware for CORS and request tracing. Errors are RFC 7807 Problem
//! Details.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use config::{ServerConfig, StoreBackend};
pub use error::{AppError, ErrorResponse, Result};
pub use server::{build_state, create_app, run_server};
pub use state::AppState;
