//! Server configuration
//!
//! Precedence, lowest to highest:
//! 1. Built-in defaults
//! 2. TOML file (`--config path`)
//! 3. Environment (`SAGA_BIND`, `SAGA_STORE_URL`, and the coordinator's
//!    `SAGA_*` overrides)
//! 4. Command-line flags, applied by the binary

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use saga_coordinator::{CoordinatorConfig, SimulationConfig, StoreConfig};
use serde::{Deserialize, Serialize};

/// Where saga records are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// SurrealDB, local (`mem://`, `rocksdb://path`) or remote (`ws://host`).
    Surreal(StoreConfig),
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Surreal(config) => {
                write!(f, "surreal {} ({}/{})", config.url, config.namespace, config.database)
            }
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub store: StoreBackend,
    pub coordinator: CoordinatorConfig,
    pub simulation: SimulationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            store: StoreBackend::Memory,
            coordinator: CoordinatorConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load defaults, the optional TOML file, then the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// environment override is malformed.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.overlay(|key| std::env::var(key).ok())
    }

    /// Parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// `SAGA_STORE_URL` switches to the SurrealDB backend when the
    /// configuration was in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `SAGA_BIND` is not a socket address.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        if let Some(bind) = lookup("SAGA_BIND") {
            self.bind = bind
                .parse()
                .with_context(|| format!("Invalid SAGA_BIND value '{bind}'"))?;
        }

        if let Some(url) = lookup("SAGA_STORE_URL").filter(|u| !u.is_empty()) {
            self.store = match self.store {
                StoreBackend::Surreal(config) => StoreBackend::Surreal(config.with_url(url)),
                StoreBackend::Memory => {
                    StoreBackend::Surreal(StoreConfig::default().with_url(url))
                }
            };
        }

        self.coordinator = self.coordinator.overlay(&lookup);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_to_memory_on_localhost() {
        let config = ServerConfig::default();
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.store, StoreBackend::Memory);
    }

    #[test]
    fn test_parses_toml_sections() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind = "0.0.0.0:8080"

            [store]
            backend = "surreal"
            url = "rocksdb://data/sagas"
            namespace = "saga"
            database = "prod"

            [coordinator]
            partition = "tenant-a"
            max_backoff_ms = 2000

            [simulation]
            failure_rate = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.port(), 8080);
        assert_eq!(
            config.store,
            StoreBackend::Surreal(
                StoreConfig::in_memory()
                    .with_url("rocksdb://data/sagas")
                    .with_database("prod")
            )
        );
        assert_eq!(config.coordinator.partition, "tenant-a");
        assert_eq!(config.coordinator.max_backoff, Duration::from_secs(2));
        assert!(config.coordinator.honor_retry_policy);
        assert!(config.simulation.failure_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn test_store_url_switches_to_surreal() {
        let config = ServerConfig::default()
            .overlay(env(&[("SAGA_STORE_URL", "ws://db:8000")]))
            .unwrap();

        match config.store {
            StoreBackend::Surreal(store) => assert_eq!(store.url, "ws://db:8000"),
            StoreBackend::Memory => panic!("expected surreal backend"),
        }
    }

    #[test]
    fn test_env_overrides_bind_and_partition() {
        let config = ServerConfig::default()
            .overlay(env(&[("SAGA_BIND", "0.0.0.0:9000"), ("SAGA_PARTITION", "p2")]))
            .unwrap();

        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.coordinator.partition, "p2");
    }

    #[test]
    fn test_rejects_malformed_bind() {
        let result = ServerConfig::default().overlay(env(&[("SAGA_BIND", "not an address")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saga.toml");
        std::fs::write(&path, "bind = \"127.0.0.1:4000\"\n").unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.bind.port(), 4000);
        assert_eq!(config.store, StoreBackend::Memory);
    }
}
