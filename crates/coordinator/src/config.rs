//! Coordinator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the saga coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Storage partition all records are written under.
    #[serde(default = "default_partition")]
    pub partition: String,

    /// Retry recoverable transaction failures per the step's retry policy.
    /// When off, every transaction gets exactly one attempt.
    #[serde(default = "default_true")]
    pub honor_retry_policy: bool,

    /// Upper bound on a single retry backoff.
    #[serde(rename = "max_backoff_ms", with = "crate::types::duration_ms", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Fail the next transaction once the saga-level timeout has elapsed.
    #[serde(default = "default_true")]
    pub enforce_saga_timeout: bool,

    /// Slack added to a step's timeout (and pending backoff) when leasing
    /// it. A `running` step is only taken over once its lease lapses.
    #[serde(rename = "lease_grace_ms", with = "crate::types::duration_ms", default = "default_lease_grace")]
    pub lease_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            partition: default_partition(),
            honor_retry_policy: true,
            max_backoff: default_max_backoff(),
            enforce_saga_timeout: true,
            lease_grace: default_lease_grace(),
        }
    }
}

impl CoordinatorConfig {
    /// Set the partition.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Enable or disable retries.
    #[must_use]
    pub const fn honor_retry_policy(mut self, honor: bool) -> Self {
        self.honor_retry_policy = honor;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Set the lease grace.
    #[must_use]
    pub const fn lease_grace(mut self, lease_grace: Duration) -> Self {
        self.lease_grace = lease_grace;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply `SAGA_*` overrides read through `lookup`.
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(partition) = lookup("SAGA_PARTITION").filter(|p| !p.is_empty()) {
            self.partition = partition;
        }
        if let Some(honor) = lookup("SAGA_HONOR_RETRY_POLICY").and_then(|v| parse_bool(&v)) {
            self.honor_retry_policy = honor;
        }
        if let Some(ms) = lookup("SAGA_MAX_BACKOFF_MS").and_then(|v| v.parse().ok()) {
            self.max_backoff = Duration::from_millis(ms);
        }
        if let Some(enforce) = lookup("SAGA_ENFORCE_TIMEOUT").and_then(|v| parse_bool(&v)) {
            self.enforce_saga_timeout = enforce;
        }
        if let Some(ms) = lookup("SAGA_LEASE_GRACE_MS").and_then(|v| v.parse().ok()) {
            self.lease_grace = Duration::from_millis(ms);
        }
        self
    }
}

/// Behavior of the simulated remote invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(rename = "min_latency_ms", with = "crate::types::duration_ms", default = "default_min_latency")]
    pub min_latency: Duration,

    #[serde(rename = "max_latency_ms", with = "crate::types::duration_ms", default = "default_max_latency")]
    pub max_latency: Duration,

    /// Probability in `[0, 1]` that a call fails.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_latency: default_min_latency(),
            max_latency: default_max_latency(),
            failure_rate: default_failure_rate(),
        }
    }
}

impl SimulationConfig {
    /// Instant calls that never fail.
    pub const fn reliable() -> Self {
        Self {
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            failure_rate: 0.0,
        }
    }

    /// `failure_rate` clamped to `[0, 1]`; NaN counts as never failing.
    #[must_use]
    pub fn failure_probability(&self) -> f64 {
        if self.failure_rate.is_nan() {
            0.0
        } else {
            self.failure_rate.clamp(0.0, 1.0)
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_partition() -> String {
    "default".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

const fn default_lease_grace() -> Duration {
    Duration::from_secs(5)
}

const fn default_min_latency() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_latency() -> Duration {
    Duration::from_millis(500)
}

const fn default_failure_rate() -> f64 {
    0.1
}
