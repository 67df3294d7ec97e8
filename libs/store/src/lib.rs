//! Versioned object store and watch bus.
//!
//! The store is the only shared state in the system. It is strongly
//! consistent: every write happens under one lock, is assigned a globally
//! monotonic `resource_version`, and is appended to an ordered change log
//! that watch subscriptions replay. Key concepts:
//!
//! - **Optimistic concurrency**: updates carry the version they were read
//!   at; a stale version fails with [`StoreError::Conflict`] and the caller
//!   re-reads before retrying.
//! - **Watch delivery**: at-least-once, ordered per object key. A
//!   subscription is restartable from a resume token (the last seen
//!   sequence number).
//! - **Graceful deletion**: pods are marked for deletion and linger until a
//!   node runtime finalizes them; other kinds are removed immediately.

mod error;
mod store;
mod watch;

pub use error::StoreError;
pub use store::ObjectStore;
pub use watch::{EventType, WatchEvent, WatchFilter, WatchStream};
