//! Deterministic spec hashing.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// A short deterministic hash of a serializable spec fragment.
///
/// Used to detect template changes and to stamp child objects with the
/// revision they were created from. The hash is 10 lowercase hex
/// characters, safe for use in object names and label values.
///
/// Serialization goes through `serde_json::Value`, whose object keys are
/// ordered, so the hash is independent of field declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Computes the hash of any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Self {
        let canonical = serde_json::to_value(value)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..5]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
