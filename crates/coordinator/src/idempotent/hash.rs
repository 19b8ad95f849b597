//! SHA-256 hashing used as input to UUID v5 key generation.

use bincode::config;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash arbitrary byte data using SHA-256.
///
/// ```
/// use saga_coordinator::idempotent::hash_input;
///
/// let hash = hash_input(b"debit");
/// assert_eq!(hash, hash_input(b"debit"));
/// assert_ne!(hash, hash_input(b"refund"));
/// ```
#[inline]
pub fn hash_input(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash a serializable value via its bincode encoding.
///
/// # Errors
///
/// Returns an error if bincode serialization fails.
pub fn hash_serializable<T: Serialize>(value: &T) -> Result<[u8; 32], bincode::error::EncodeError> {
    let bytes = bincode::serde::encode_to_vec(value, config::standard())?;
    Ok(hash_input(&bytes))
}
