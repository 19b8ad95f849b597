//! Idempotency keys for remote step invocations.
//!
//! Every call the coordinator makes carries a UUID v5 key derived from the
//! execution id, the step id and the call direction. A step that is invoked
//! again after a crash or a retry presents the same key, so a remote service
//! that deduplicates on it applies the effect at most once.
//!
//! # Algorithm
//!
//! ```text
//! namespace = UUID v5(DNS_NAMESPACE, "saga-execution:" + execution_id)
//! step_hash = SHA-256(bincode(step_id, direction))
//! key       = UUID v5(namespace, step_hash)
//! ```

pub mod hash;
pub mod keys;

pub use hash::{hash_input, hash_serializable};
pub use keys::{namespace_from_execution, step_key};
