//! Shared application state

use std::sync::Arc;

use saga_coordinator::SagaCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SagaCoordinator>,
}

impl AppState {
    pub fn new(coordinator: SagaCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }
}
