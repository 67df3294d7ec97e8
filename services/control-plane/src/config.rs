//! Configuration for the control plane.

use anyhow::Result;

/// Control plane configuration, loaded from `TILLER_*` environment
/// variables with defaults suitable for a single-process dev cluster.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reconcile workers per controller.
    pub workers: usize,

    /// Periodic full-requeue interval in seconds.
    pub resync_interval_secs: u64,

    /// Autoscaler evaluation period in seconds.
    pub autoscale_interval_secs: u64,

    /// Readiness probe polling interval in milliseconds.
    pub probe_interval_millis: u64,

    /// Simulated node runtime tick in milliseconds.
    pub runtime_tick_millis: u64,

    /// Nodes registered at startup by the simulated runtime.
    pub simulated_nodes: u32,

    /// Allocatable cpu per simulated node, in millicores.
    pub node_cpu_millis: u64,

    /// Allocatable memory per simulated node, in bytes.
    pub node_memory_bytes: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workers: env_or("TILLER_WORKERS", 2),
            resync_interval_secs: env_or("TILLER_RESYNC_INTERVAL", 30),
            autoscale_interval_secs: env_or("TILLER_AUTOSCALE_INTERVAL", 15),
            probe_interval_millis: env_or("TILLER_PROBE_INTERVAL_MS", 500),
            runtime_tick_millis: env_or("TILLER_RUNTIME_TICK_MS", 500),
            simulated_nodes: env_or("TILLER_SIMULATED_NODES", 3),
            node_cpu_millis: env_or("TILLER_NODE_CPU_MILLIS", 4000),
            node_memory_bytes: env_or("TILLER_NODE_MEMORY_BYTES", 8 << 30),
        })
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
