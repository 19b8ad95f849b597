//! Server setup with Tower middleware

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use saga_coordinator::{
    BroadcastPublisher, InMemorySagaStore, InvokerRegistry, SagaCoordinator, SagaStore,
    SimulatedInvoker, SurrealSagaStore,
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use super::config::{ServerConfig, StoreBackend};
use super::routes;
use super::state::AppState;

/// Open the configured store and assemble the coordinator.
///
/// Steps without a registered invoker fall back to the simulated one.
///
/// # Errors
///
/// Returns an error if the SurrealDB store cannot be reached.
pub async fn build_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn SagaStore> = match &config.store {
        StoreBackend::Memory => Arc::new(InMemorySagaStore::new()),
        StoreBackend::Surreal(store_config) => Arc::new(
            SurrealSagaStore::connect(store_config.clone())
                .await
                .with_context(|| format!("Failed to open saga store at {}", store_config.url))?,
        ),
    };

    let invokers = InvokerRegistry::with_fallback(Arc::new(SimulatedInvoker::new(
        config.simulation.clone(),
    )));

    let coordinator = SagaCoordinator::new(store, Arc::new(invokers), config.coordinator.clone())
        .with_publisher(Arc::new(BroadcastPublisher::default()));

    Ok(AppState::new(coordinator))
}

/// Create the axum application with middleware
pub fn create_app(state: AppState) -> Router {
    routes::create_router()
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Run the axum server until Ctrl-C
///
/// Executions left unfinished by a previous process are resumed in the
/// background once the store is open.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the address is taken.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let state = build_state(&config).await?;

    let coordinator = Arc::clone(&state.coordinator);
    tokio::spawn(async move {
        match coordinator.recover_incomplete().await {
            Ok(recovered) if !recovered.is_empty() => {
                info!(count = recovered.len(), "Recovered incomplete sagas");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "Saga recovery failed"),
        }
    });

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("Saga API listening on {}", config.bind);

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Saga API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
    }
}
