//! Saga definition types.
//!
//! A [`SagaDefinition`] is immutable once stored. It names the ordered
//! forward transactions, the compensations that undo them, and the timeouts
//! that bound each remote call.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Saga definition: ordered transactions plus their compensations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaDefinition {
    /// Caller-assigned unique identifier.
    pub saga_id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Forward transactions in execution order.
    pub transactions: Vec<Transaction>,
    /// Compensations referenced by transactions.
    #[serde(default)]
    pub compensations: Vec<Compensation>,
    /// Overall saga timeout.
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
    /// Set by the definition store when the definition is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl SagaDefinition {
    /// Create a new definition with a 5 minute overall timeout.
    pub fn new(saga_id: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            name: None,
            transactions: Vec::new(),
            compensations: Vec::new(),
            timeout: Duration::from_secs(300),
            created_at: None,
        }
    }

    /// Set the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append a transaction.
    #[must_use]
    pub fn add_transaction(mut self, transaction: Transaction) -> Self {
        self.transactions.push(transaction);
        self
    }

    /// Append a compensation.
    #[must_use]
    pub fn add_compensation(mut self, compensation: Compensation) -> Self {
        self.compensations.push(compensation);
        self
    }

    /// Set the overall timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Find a transaction by id.
    pub fn transaction(&self, transaction_id: &str) -> Option<&Transaction> {
        self.transactions
            .iter()
            .find(|t| t.transaction_id == transaction_id)
    }

    /// Find a compensation by id.
    pub fn compensation(&self, compensation_id: &str) -> Option<&Compensation> {
        self.compensations
            .iter()
            .find(|c| c.compensation_id == compensation_id)
    }

    /// Compensation that undoes the given transaction, if it has one.
    pub fn compensation_for(&self, transaction: &Transaction) -> Option<&Compensation> {
        transaction
            .compensation_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .and_then(|id| self.compensation(id))
    }
}

/// One forward step of a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique within the saga.
    pub transaction_id: String,
    /// Remote service that owns the operation.
    pub service_name: String,
    /// Operation to invoke on the service.
    pub operation: String,
    /// How the call input is built from the saga context.
    #[serde(default)]
    pub input_template: InputTemplate,
    /// Compensation that undoes this transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_id: Option<String>,
    /// Bound on a single invocation.
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
    /// Retry policy for recoverable failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl Transaction {
    /// Create a new transaction with a 30 second timeout.
    pub fn new(
        transaction_id: impl Into<String>,
        service_name: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            service_name: service_name.into(),
            operation: operation.into(),
            input_template: InputTemplate::default(),
            compensation_id: None,
            timeout: Duration::from_secs(30),
            retry_policy: None,
        }
    }

    /// Set the compensation reference.
    #[must_use]
    pub fn compensated_by(mut self, compensation_id: impl Into<String>) -> Self {
        self.compensation_id = Some(compensation_id.into());
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the input template.
    #[must_use]
    pub fn with_input(mut self, template: InputTemplate) -> Self {
        self.input_template = template;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Total attempts allowed for this transaction.
    pub fn max_attempts(&self) -> u32 {
        self.retry_policy
            .as_ref()
            .map_or(1, |p| p.max_attempts.max(1))
    }
}

/// Operation that semantically undoes a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compensation {
    /// Unique within the saga.
    pub compensation_id: String,
    /// Remote service that owns the operation.
    pub service_name: String,
    /// Operation to invoke on the service.
    pub operation: String,
    /// How the call input is built from the saga context.
    #[serde(default)]
    pub input_template: InputTemplate,
    /// Bound on a single invocation.
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
}

impl Compensation {
    /// Create a new compensation with a 30 second timeout.
    pub fn new(
        compensation_id: impl Into<String>,
        service_name: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            compensation_id: compensation_id.into(),
            service_name: service_name.into(),
            operation: operation.into(),
            input_template: InputTemplate::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the input template.
    #[must_use]
    pub fn with_input(mut self, template: InputTemplate) -> Self {
        self.input_template = template;
        self
    }
}

/// Retry policy for a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(rename = "initialDelayMs", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after each attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a retry policy.
    pub const fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
        }
    }

    /// Delay to wait after the given failed attempt (1-based), capped at `max`.
    pub fn backoff(&self, attempt: u32, max: Duration) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            return max;
        }
        Duration::try_from_secs_f64(secs).map_or(max, |d| d.min(max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_millis(100), 2.0)
    }
}

/// How a step's call input is derived from the accumulated saga context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputTemplate {
    /// The whole context object.
    #[default]
    Context,
    /// A fixed value, independent of the context.
    Static(Value),
    /// Only the listed context keys; missing keys are omitted.
    Select(Vec<String>),
    /// A JSON document whose `"${key}"` string leaves are replaced with
    /// the context value under `key` (or `null` when absent).
    Template(Value),
}

impl InputTemplate {
    /// Build the call input from the context.
    pub fn render(&self, context: &Map<String, Value>) -> Value {
        match self {
            Self::Context => Value::Object(context.clone()),
            Self::Static(value) => value.clone(),
            Self::Select(keys) => Value::Object(
                keys.iter()
                    .filter_map(|k| context.get(k).map(|v| (k.clone(), v.clone())))
                    .collect(),
            ),
            Self::Template(template) => substitute(template, context),
        }
    }
}

fn substitute(template: &Value, context: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => placeholder(s).map_or_else(
            || template.clone(),
            |key| context.get(key).cloned().unwrap_or(Value::Null),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, context)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn placeholder(s: &str) -> Option<&str> {
    s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}'))
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
