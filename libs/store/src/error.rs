//! Store errors.

use thiserror::Error;
use tiller_api::{ObjectKey, ValidationError};

/// Errors from object store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Malformed desired state, rejected at submission. Never retried.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Stale write detected by the version check. Callers re-read current
    /// state and retry.
    #[error("conflict on {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("object not found: {0}")]
    NotFound(ObjectKey),

    #[error("object already exists: {0}")]
    AlreadyExists(ObjectKey),
}

impl StoreError {
    /// Returns true if the error is a version conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
