//! Tiller control plane.
//!
//! Wires the shared object store, the placement scheduler, and the
//! reconciliation controllers into one process:
//!
//! - **Scheduler**: filters and scores nodes against a per-cycle cluster
//!   snapshot, then commits bindings with an optimistic version guard.
//! - **Controllers**: ReplicaSet, Deployment rollout, StatefulSet ordered
//!   lifecycle, horizontal autoscaler, volume binder, and the owner-reference
//!   garbage collector.
//! - **Rollout engine**: the surge/unavailability-bounded step arithmetic
//!   behind deployment updates.
//! - **External collaborators**: probes, metrics, and volume provisioning
//!   behind traits, with simulated implementations for dev and test.

pub mod config;
pub mod controllers;
pub mod external;
pub mod rollout;
pub mod scheduler;
