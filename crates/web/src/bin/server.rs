//! Saga coordinator server binary

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use saga_web::ServerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "saga-server", version, about = "Saga coordinator HTTP server")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "SAGA_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the file and SAGA_BIND
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,saga_web=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    tracing::info!(
        bind = %config.bind,
        store = %config.store,
        partition = %config.coordinator.partition,
        "Starting saga server"
    );

    saga_web::run_server(config).await
}
