//! Controller runtime primitives.
//!
//! A controller is a reconcile function run behind a per-key work queue:
//!
//! - Watch events are mapped to object keys and enqueued; duplicate keys
//!   coalesce.
//! - At most one reconcile is in flight per key. An event arriving for an
//!   in-flight key marks it dirty; the key is requeued once the current
//!   pass finishes, so the newer state supersedes the abandoned result.
//! - Failures are retried with exponential backoff and full jitter without
//!   blocking other keys.
//!
//! Reconcilers are level triggered: they re-read current state from the
//! store on every pass instead of trusting event payloads, which makes
//! duplicate and replayed events harmless.

mod backoff;
mod controller;
mod hash;
mod queue;

pub use backoff::{BackoffPolicy, RetryTracker};
pub use controller::{Controller, ControllerOptions, ReconcileAction, ReconcileError, Reconciler};
pub use hash::SpecHash;
pub use queue::WorkQueue;
