//! Tiller control plane binary.
//!
//! Runs the whole reconciliation core in one process: the object store,
//! the scheduler, every controller, and simulated external collaborators
//! (probes, metrics, volume provisioning, node runtime) so desired state
//! submitted to the store converges without any real infrastructure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tiller_api::{NodeObject, NodeSpec, Object, Payload, ResourceSet};
use tiller_runtime::{Controller, ControllerOptions};
use tiller_store::ObjectStore;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tiller_control_plane::config::Config;
use tiller_control_plane::controllers::{
    AutoscalerController, DeploymentController, GcController, ReplicaSetController,
    StatefulSetController, VolumeBinderController,
};
use tiller_control_plane::external::{
    run_node_runtime, run_probe_sync, MetricsSource, ProbeSource, SimulatedMetrics,
    SimulatedProbes, SimulatedProvisioner, VolumeProvisioner,
};
use tiller_control_plane::scheduler::SchedulerController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting tiller control plane");
    let config = Config::from_env()?;
    info!(
        workers = config.workers,
        simulated_nodes = config.simulated_nodes,
        "configuration loaded"
    );

    let store = ObjectStore::new();
    seed_nodes(&store, &config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probes: Arc<dyn ProbeSource> = Arc::new(SimulatedProbes::new(true));
    let metrics: Arc<dyn MetricsSource> = Arc::new(SimulatedMetrics::with_fallback(0.0));
    let provisioner: Arc<dyn VolumeProvisioner> = Arc::new(SimulatedProvisioner::new(true));

    let options = ControllerOptions {
        workers: config.workers,
        resync_interval: Some(Duration::from_secs(config.resync_interval_secs)),
        ..ControllerOptions::default()
    };

    let controllers = vec![
        Controller::spawn(
            Arc::new(SchedulerController::new(store.clone())),
            store.clone(),
            options.clone(),
            shutdown_rx.clone(),
        ),
        Controller::spawn(
            Arc::new(ReplicaSetController::new(store.clone())),
            store.clone(),
            options.clone(),
            shutdown_rx.clone(),
        ),
        Controller::spawn(
            Arc::new(DeploymentController::new(store.clone())),
            store.clone(),
            options.clone(),
            shutdown_rx.clone(),
        ),
        Controller::spawn(
            Arc::new(StatefulSetController::new(store.clone())),
            store.clone(),
            options.clone(),
            shutdown_rx.clone(),
        ),
        Controller::spawn(
            Arc::new(AutoscalerController::new(
                store.clone(),
                Arc::clone(&metrics),
                Duration::from_secs(config.autoscale_interval_secs),
            )),
            store.clone(),
            options.clone(),
            shutdown_rx.clone(),
        ),
        Controller::spawn(
            Arc::new(VolumeBinderController::new(
                store.clone(),
                Arc::clone(&provisioner),
            )),
            store.clone(),
            options.clone(),
            shutdown_rx.clone(),
        ),
        Controller::spawn(
            Arc::new(GcController::new(store.clone())),
            store.clone(),
            options,
            shutdown_rx.clone(),
        ),
    ];

    let runtime_handle = tokio::spawn(run_node_runtime(
        store.clone(),
        Duration::from_millis(config.runtime_tick_millis),
        shutdown_rx.clone(),
    ));
    let probe_handle = tokio::spawn(run_probe_sync(
        store.clone(),
        probes,
        Duration::from_millis(config.probe_interval_millis),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(true);

    for controller in controllers {
        controller.join().await;
    }
    let _ = runtime_handle.await;
    let _ = probe_handle.await;
    info!("control plane shutdown complete");
    Ok(())
}

/// Registers the simulated fleet, spread over three zones.
fn seed_nodes(store: &ObjectStore, config: &Config) -> Result<()> {
    const ZONES: [&str; 3] = ["a", "b", "c"];
    for index in 0..config.simulated_nodes {
        let mut node = Object::cluster_scoped(
            format!("node-{index}"),
            Payload::Node(NodeObject {
                spec: NodeSpec {
                    allocatable: ResourceSet::new(config.node_cpu_millis, config.node_memory_bytes),
                    taints: vec![],
                },
                status: Default::default(),
            }),
        );
        node.meta
            .labels
            .insert("zone", ZONES[index as usize % ZONES.len()]);
        store.create(node)?;
        info!(node = %format!("node-{index}"), "registered simulated node");
    }
    Ok(())
}
