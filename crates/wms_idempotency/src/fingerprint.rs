//! Request fingerprinting and idempotency-key validation.
//!
//! Fingerprint = SHA-256 over `METHOD \n path \n body`, hex encoded.
//! It is the only thing that separates "same logical retry" from
//! "key reused with different parameters".

use crate::error::KeyError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque, comparable request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate a fingerprint read back from storage.
    pub fn from_stored(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash a request. Pure and deterministic; computed before any lock attempt.
pub fn fingerprint(method: &str, path: &str, body: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Trim surrounding whitespace from a raw header value.
pub fn normalize_key(raw: &str) -> &str {
    raw.trim()
}

pub fn is_valid_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Validate an already-normalized key.
pub fn validate_key(key: &str, max_len: usize) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Required);
    }
    let len = key.chars().count();
    if len > max_len {
        return Err(KeyError::TooLong { len, max: max_len });
    }
    if let Some(bad) = key.chars().find(|c| !is_valid_key_char(*c)) {
        return Err(KeyError::InvalidCharacter(bad));
    }
    Ok(())
}
