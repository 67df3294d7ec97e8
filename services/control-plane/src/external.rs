//! External collaborator interfaces.
//!
//! The control plane consumes readiness probes, metric values, and volume
//! provisioning through the traits here; the transports behind them
//! (HTTP/TCP/exec probing, metric pipelines, storage drivers) are out of
//! scope. Simulated implementations back the binary's dev mode and the
//! tests, alongside a simulated node runtime that plays the part of a node
//! agent for pods bound by the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tiller_api::{set_condition, Condition, Kind, Object, ObjectKey, PodPhase, PvSpec};
use tiller_store::ObjectStore;
use tokio::sync::watch;
use tracing::debug;

use crate::controllers::generated_name;

/// Failure talking to an external collaborator.
#[derive(Debug, Clone, Error)]
pub enum ExternalError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Readiness probe results, reported per pod by an external health checker.
///
/// The control plane consumes boolean outcomes on a polling interval; it
/// never performs the probing itself.
#[async_trait]
pub trait ProbeSource: Send + Sync + 'static {
    async fn ready(&self, pod: &ObjectKey) -> Result<bool, ExternalError>;
}

/// Current metric values for autoscaling targets.
#[async_trait]
pub trait MetricsSource: Send + Sync + 'static {
    async fn current_value(&self, target: &ObjectKey, metric: &str) -> Result<f64, ExternalError>;
}

/// Outcome of asking the provisioner for a volume.
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    /// A volume was created; the binder matches it on its next pass.
    Provisioned { name: String, spec: PvSpec },

    /// Nothing available yet; the claim stays pending.
    Pending,
}

/// Creates backing volumes on demand.
///
/// The control plane only performs the claim/volume binding match; physical
/// volume creation lives behind this trait.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync + 'static {
    async fn provision(&self, claim: &Object) -> Result<ProvisionOutcome, ExternalError>;
}

// =============================================================================
// Simulated collaborators
// =============================================================================

/// Probe source with a configurable default and per-pod overrides.
pub struct SimulatedProbes {
    default_ready: AtomicBool,
    overrides: Mutex<HashMap<ObjectKey, bool>>,
}

impl SimulatedProbes {
    #[must_use]
    pub fn new(default_ready: bool) -> Self {
        Self {
            default_ready: AtomicBool::new(default_ready),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Changes the outcome reported for pods without an override.
    pub fn set_default(&self, ready: bool) {
        self.default_ready.store(ready, Ordering::SeqCst);
    }

    /// Pins the outcome for one pod.
    pub fn set_ready(&self, pod: ObjectKey, ready: bool) {
        self.overrides
            .lock()
            .expect("probe lock poisoned")
            .insert(pod, ready);
    }

    /// Drops a pod's override, falling back to the default.
    pub fn clear(&self, pod: &ObjectKey) {
        self.overrides
            .lock()
            .expect("probe lock poisoned")
            .remove(pod);
    }
}

#[async_trait]
impl ProbeSource for SimulatedProbes {
    async fn ready(&self, pod: &ObjectKey) -> Result<bool, ExternalError> {
        let overrides = self.overrides.lock().expect("probe lock poisoned");
        Ok(overrides
            .get(pod)
            .copied()
            .unwrap_or_else(|| self.default_ready.load(Ordering::SeqCst)))
    }
}

/// Metrics source backed by a value map, with an optional fallback for
/// metrics that were never set.
pub struct SimulatedMetrics {
    values: Mutex<HashMap<(ObjectKey, String), f64>>,
    fallback: Option<f64>,
}

impl SimulatedMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            fallback: None,
        }
    }

    /// A source that answers `fallback` for any metric not explicitly set.
    #[must_use]
    pub fn with_fallback(fallback: f64) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            fallback: Some(fallback),
        }
    }

    pub fn set(&self, target: ObjectKey, metric: impl Into<String>, value: f64) {
        self.values
            .lock()
            .expect("metrics lock poisoned")
            .insert((target, metric.into()), value);
    }
}

impl Default for SimulatedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSource for SimulatedMetrics {
    async fn current_value(&self, target: &ObjectKey, metric: &str) -> Result<f64, ExternalError> {
        let values = self.values.lock().expect("metrics lock poisoned");
        values
            .get(&(target.clone(), metric.to_string()))
            .copied()
            .or(self.fallback)
            .ok_or_else(|| {
                ExternalError::Unavailable(format!("no value for metric {metric} on {target}"))
            })
    }
}

/// Provisioner that mirrors each claim into a volume of exactly the
/// requested shape, or reports `Pending` when disabled.
pub struct SimulatedProvisioner {
    enabled: AtomicBool,
}

impl SimulatedProvisioner {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl VolumeProvisioner for SimulatedProvisioner {
    async fn provision(&self, claim: &Object) -> Result<ProvisionOutcome, ExternalError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(ProvisionOutcome::Pending);
        }
        let spec = claim
            .as_pvc()
            .map(|c| &c.spec)
            .ok_or_else(|| ExternalError::Unavailable("provision target is not a claim".into()))?;
        Ok(ProvisionOutcome::Provisioned {
            name: generated_name("pv"),
            spec: PvSpec {
                storage_class: spec.storage_class.clone(),
                access_modes: spec.access_modes.clone(),
                capacity_bytes: spec.request_bytes,
                reclaim: Default::default(),
            },
        })
    }
}

// =============================================================================
// Simulated node runtime and probe sync
// =============================================================================

/// Plays the part of a fleet of node agents: bound pending pods start
/// running after a tick, and terminating pods are finalized and removed
/// once their grace tick elapses.
pub async fn run_node_runtime(
    store: ObjectStore,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => step_node_runtime(&store),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// One tick of the simulated runtime, exposed for tests.
pub fn step_node_runtime(store: &ObjectStore) {
    for object in store.list(Kind::Pod, None, None) {
        let Some(pod) = object.as_pod() else { continue };

        if object.meta.is_deleting() {
            if let Err(err) = store.remove(&object.key()) {
                debug!(pod = %object.key(), error = %err, "pod finalize raced");
            }
            continue;
        }

        if pod.spec.node_name.is_some() && pod.status.phase == PodPhase::Pending {
            let mut updated = object.clone();
            if let Some(p) = updated.as_pod_mut() {
                p.status.phase = PodPhase::Running;
            }
            if let Err(err) = store.update(updated) {
                debug!(pod = %object.key(), error = %err, "pod start raced");
            }
        }
    }
}

/// Polls the probe source for running pods and writes readiness into pod
/// status, stamping `ready_since` on the false-to-true transition.
pub async fn run_probe_sync(
    store: ObjectStore,
    probes: std::sync::Arc<dyn ProbeSource>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => step_probe_sync(&store, probes.as_ref()).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Bound on one probe-source round trip, so a hung collaborator cannot
/// stall the whole sweep.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// One probe sweep, exposed for tests.
pub async fn step_probe_sync(store: &ObjectStore, probes: &dyn ProbeSource) {
    for object in store.list(Kind::Pod, None, None) {
        let Some(pod) = object.as_pod() else { continue };
        if object.meta.is_deleting() || pod.status.phase != PodPhase::Running {
            continue;
        }

        let outcome = tokio::time::timeout(PROBE_TIMEOUT, probes.ready(&object.key())).await;
        let ready = match outcome {
            Ok(Ok(ready)) => ready,
            Ok(Err(err)) => {
                debug!(pod = %object.key(), error = %err, "probe source unavailable");
                continue;
            }
            Err(_) => {
                debug!(pod = %object.key(), "probe timed out");
                continue;
            }
        };
        if ready == pod.status.ready {
            continue;
        }

        let mut updated = object.clone();
        if let Some(p) = updated.as_pod_mut() {
            p.status.ready = ready;
            p.status.ready_since = ready.then(Utc::now);
            let (reason, message) = if ready {
                ("ProbeSucceeded", "readiness probe reported success")
            } else {
                ("ProbeFailed", "readiness probe reported failure")
            };
            set_condition(
                &mut p.status.conditions,
                Condition::new("Ready", ready, reason, message),
            );
        }
        if let Err(err) = store.update(updated) {
            debug!(pod = %object.key(), error = %err, "readiness write raced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_api::{Payload, PodObject, PodSpec};

    fn pod(name: &str, node: Option<&str>) -> Object {
        Object::new(
            "default",
            name,
            Payload::Pod(PodObject {
                spec: PodSpec {
                    image: "registry/web:v1".to_string(),
                    node_name: node.map(str::to_string),
                    ..PodSpec::default()
                },
                status: Default::default(),
            }),
        )
    }

    #[test]
    fn runtime_starts_bound_pods_only() {
        let store = ObjectStore::new();
        store.create(pod("bound", Some("worker-1"))).unwrap();
        store.create(pod("unbound", None)).unwrap();

        step_node_runtime(&store);

        let bound = store.get(&pod("bound", None).key()).unwrap();
        assert_eq!(bound.as_pod().unwrap().status.phase, PodPhase::Running);
        let unbound = store.get(&pod("unbound", None).key()).unwrap();
        assert_eq!(unbound.as_pod().unwrap().status.phase, PodPhase::Pending);
    }

    #[test]
    fn runtime_finalizes_terminating_pods() {
        let store = ObjectStore::new();
        let created = store.create(pod("doomed", Some("worker-1"))).unwrap();
        store.mark_for_deletion(&created.key()).unwrap();

        step_node_runtime(&store);
        assert!(store.get(&created.key()).is_err());
    }

    #[tokio::test]
    async fn probe_sync_stamps_ready_since_on_transition() {
        let store = ObjectStore::new();
        let created = store.create(pod("web", Some("worker-1"))).unwrap();
        step_node_runtime(&store);

        let probes = SimulatedProbes::new(true);
        step_probe_sync(&store, &probes).await;

        let ready = store.get(&created.key()).unwrap();
        let status = &ready.as_pod().unwrap().status;
        assert!(status.ready);
        assert!(status.ready_since.is_some());

        // Flip back: the transition record is cleared.
        probes.set_ready(created.key(), false);
        step_probe_sync(&store, &probes).await;
        let unready = store.get(&created.key()).unwrap();
        let status = &unready.as_pod().unwrap().status;
        assert!(!status.ready);
        assert!(status.ready_since.is_none());
    }

    #[tokio::test]
    async fn probe_overrides_beat_the_default() {
        let probes = SimulatedProbes::new(true);
        let key = pod("web", None).key();
        assert!(probes.ready(&key).await.unwrap());

        probes.set_ready(key.clone(), false);
        assert!(!probes.ready(&key).await.unwrap());

        probes.clear(&key);
        assert!(probes.ready(&key).await.unwrap());
    }

    #[tokio::test]
    async fn metrics_fall_back_or_fail() {
        let key = pod("web", None).key();
        let strict = SimulatedMetrics::new();
        assert!(strict.current_value(&key, "cpu").await.is_err());

        let lenient = SimulatedMetrics::with_fallback(0.0);
        assert_eq!(lenient.current_value(&key, "cpu").await.unwrap(), 0.0);

        lenient.set(key.clone(), "cpu", 140.0);
        assert_eq!(lenient.current_value(&key, "cpu").await.unwrap(), 140.0);
    }
}
