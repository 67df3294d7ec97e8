//! Validation errors for submitted objects.

use thiserror::Error;

use crate::meta::Kind;

/// Rejection reasons for malformed desired state.
///
/// Validation failures are terminal: the write is refused and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid namespace {namespace:?} for {kind}: {reason}")]
    InvalidNamespace {
        namespace: String,
        kind: Kind,
        reason: &'static str,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("selector must not be empty")]
    EmptySelector,

    #[error("selector does not match pod template labels")]
    SelectorMismatch,

    #[error("min_replicas {min} must be at least 1 and at most max_replicas {max}")]
    ReplicaBounds { min: u32, max: u32 },

    #[error("metric {0:?} must have a positive target")]
    NonPositiveTarget(String),

    #[error("{0}")]
    Invalid(&'static str),
}
