//! Pod placement: filter, score, bind.
//!
//! Scheduling runs against an immutable [`ClusterSnapshot`] captured per
//! cycle. The filter phase removes nodes violating hard constraints; the
//! score phase ranks the survivors; the binding write is conditioned on the
//! chosen node's version being unchanged since the snapshot, so a stale
//! decision fails with a conflict and the pod is re-filtered and re-scored.
//!
//! Scoring weights are implementation policy, not contract: preferred
//! affinity and anti-affinity terms contribute their declared weights
//! directly (anti-affinity as `weight * matching pods` penalty), each
//! `PreferNoSchedule` taint costs [`SOFT_TAINT_PENALTY`] points, and
//! resource balance contributes up to [`BALANCE_WEIGHT`] points, full nodes
//! scoring zero. Ties break toward the least-loaded node, then
//! lexicographic name order.

pub mod snapshot;

use async_trait::async_trait;
use thiserror::Error;
use tiller_api::{get_condition, set_condition, Condition, Kind, ObjectKey, PodObject, TaintEffect};
use tiller_runtime::{ReconcileAction, ReconcileError, Reconciler};
use tiller_store::{EventType, ObjectStore, StoreError, WatchEvent, WatchFilter};
use tracing::{debug, info};

pub use snapshot::{ClusterSnapshot, NodeInfo};

/// Condition type recording the placement outcome on a pod.
pub const CONDITION_SCHEDULED: &str = "PodScheduled";

/// Points awarded for perfect resource balance.
const BALANCE_WEIGHT: f64 = 100.0;

/// Penalty per `PreferNoSchedule` taint on an otherwise eligible node.
const SOFT_TAINT_PENALTY: i64 = 50;

/// Why a node was eliminated during the filter phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterReason {
    InsufficientCpu,
    InsufficientMemory,
    NodeAffinityMismatch,
    AntiAffinityViolation,
    Tainted,
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FilterReason::InsufficientCpu => "insufficient cpu",
            FilterReason::InsufficientMemory => "insufficient memory",
            FilterReason::NodeAffinityMismatch => "node affinity mismatch",
            FilterReason::AntiAffinityViolation => "anti-affinity violation",
            FilterReason::Tainted => "tainted",
        };
        write!(f, "{}", s)
    }
}

/// Scheduling errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// No node passed the filter phase. Persisted as a status condition and
    /// re-evaluated on every node change, never silently dropped.
    #[error("unschedulable: {0}")]
    Unschedulable(String),
}

/// A placement decision plus the version guard for the binding write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_name: String,
    pub node_version: u64,
}

/// Hard-constraint check for one candidate node.
fn filter_node(
    pod: &PodObject,
    node: &NodeInfo,
    snapshot: &ClusterSnapshot,
) -> Result<(), FilterReason> {
    if node
        .taints
        .iter()
        .any(|t| t.effect == TaintEffect::NoSchedule)
    {
        return Err(FilterReason::Tainted);
    }

    let free = node.free();
    if pod.spec.resources.cpu_millis > free.cpu_millis {
        return Err(FilterReason::InsufficientCpu);
    }
    if pod.spec.resources.memory_bytes > free.memory_bytes {
        return Err(FilterReason::InsufficientMemory);
    }

    if let Some(affinity) = &pod.spec.node_affinity {
        // Required terms are or-ed: any matching term admits the node.
        if !affinity.required.is_empty()
            && !affinity.required.iter().any(|s| s.matches(&node.labels))
        {
            return Err(FilterReason::NodeAffinityMismatch);
        }
    }

    if let Some(anti) = &pod.spec.anti_affinity {
        for term in &anti.required {
            if snapshot.matching_pods_in_domain(node, &term.selector, &term.topology_key) > 0 {
                return Err(FilterReason::AntiAffinityViolation);
            }
        }
    }

    Ok(())
}

/// Soft-preference score for one surviving node. Higher is better.
fn score_node(pod: &PodObject, node: &NodeInfo, snapshot: &ClusterSnapshot) -> i64 {
    let mut score = 0i64;

    if let Some(affinity) = &pod.spec.node_affinity {
        for term in &affinity.preferred {
            if term.selector.matches(&node.labels) {
                score += i64::from(term.weight);
            }
        }
    }

    if let Some(anti) = &pod.spec.anti_affinity {
        for term in &anti.preferred {
            let matching =
                snapshot.matching_pods_in_domain(node, &term.term.selector, &term.term.topology_key);
            score -= i64::from(term.weight) * matching as i64;
        }
    }

    let soft_taints = node
        .taints
        .iter()
        .filter(|t| t.effect == TaintEffect::PreferNoSchedule)
        .count() as i64;
    score -= soft_taints * SOFT_TAINT_PENALTY;

    score + (BALANCE_WEIGHT * (1.0 - load_after(pod, node)).max(0.0)) as i64
}

/// Dominant utilization fraction of the node if the pod were placed on it.
fn load_after(pod: &PodObject, node: &NodeInfo) -> f64 {
    node.requested
        .add(&pod.spec.resources)
        .dominant_fraction_of(&node.allocatable)
}

/// Selects the node for an unplaced pod, or explains why none fits.
pub fn select_node(pod: &PodObject, snapshot: &ClusterSnapshot) -> Result<Placement, SchedulerError> {
    if snapshot.is_empty() {
        return Err(SchedulerError::Unschedulable("no nodes registered".into()));
    }

    let mut rejections: std::collections::BTreeMap<FilterReason, usize> =
        std::collections::BTreeMap::new();
    let mut best: Option<(&NodeInfo, i64, f64)> = None;
    let mut total = 0usize;

    for node in snapshot.nodes() {
        total += 1;
        if let Err(reason) = filter_node(pod, node, snapshot) {
            *rejections.entry(reason).or_insert(0) += 1;
            continue;
        }

        let score = score_node(pod, node, snapshot);
        let load = load_after(pod, node);
        let better = match &best {
            None => true,
            Some((current, best_score, best_load)) => {
                score > *best_score
                    || (score == *best_score
                        && (load < *best_load
                            || (load == *best_load && node.name < current.name)))
            }
        };
        if better {
            best = Some((node, score, load));
        }
    }

    match best {
        Some((node, _, _)) => Ok(Placement {
            node_name: node.name.clone(),
            node_version: node.resource_version,
        }),
        None => {
            let detail: Vec<String> = rejections
                .iter()
                .map(|(reason, count)| format!("{count} {reason}"))
                .collect();
            Err(SchedulerError::Unschedulable(format!(
                "0/{total} nodes available: {}",
                detail.join(", ")
            )))
        }
    }
}

/// The scheduler as a controller: watches unplaced pods and node changes,
/// binds one pod per reconcile pass.
pub struct SchedulerController {
    store: ObjectStore,
}

impl SchedulerController {
    #[must_use]
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    fn unplaced_pod_keys(&self) -> Vec<ObjectKey> {
        self.store
            .list(Kind::Pod, None, None)
            .into_iter()
            .filter(|o| {
                !o.meta.is_deleting()
                    && o.as_pod()
                        .is_some_and(|p| p.spec.node_name.is_none() && p.is_active())
            })
            .map(|o| o.key())
            .collect()
    }
}

#[async_trait]
impl Reconciler for SchedulerController {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn watches(&self) -> Vec<WatchFilter> {
        vec![WatchFilter::kind(Kind::Pod), WatchFilter::kind(Kind::Node)]
    }

    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match event.object.kind() {
            Kind::Pod => {
                if event.event_type == EventType::Deleted || event.object.meta.is_deleting() {
                    return Vec::new();
                }
                match event.object.as_pod() {
                    Some(pod) if pod.spec.node_name.is_none() && pod.is_active() => {
                        vec![event.key()]
                    }
                    _ => Vec::new(),
                }
            }
            // Any node change can unblock pending pods: re-evaluate them all.
            Kind::Node => self.unplaced_pod_keys(),
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let object = match self.store.get(key) {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => return Ok(ReconcileAction::done()),
            Err(err) => return Err(err.into()),
        };
        let Some(pod) = object.as_pod() else {
            return Ok(ReconcileAction::done());
        };
        if object.meta.is_deleting() || pod.spec.node_name.is_some() || !pod.is_active() {
            return Ok(ReconcileAction::done());
        }

        let snapshot = ClusterSnapshot::capture(&self.store);
        match select_node(pod, &snapshot) {
            Ok(placement) => {
                let node_key = ObjectKey::new(Kind::Node, "", placement.node_name.clone());
                let mut bound = object.clone();
                if let Some(p) = bound.as_pod_mut() {
                    p.spec.node_name = Some(placement.node_name.clone());
                    set_condition(
                        &mut p.status.conditions,
                        Condition::new(
                            CONDITION_SCHEDULED,
                            true,
                            "Scheduled",
                            format!("assigned to {}", placement.node_name),
                        ),
                    );
                }
                // Conflict here means the snapshot went stale; the requeue
                // re-filters and re-scores against fresh state.
                self.store
                    .guarded_update(&node_key, placement.node_version, bound)?;
                info!(pod = %key, node = %placement.node_name, "pod bound");
                Ok(ReconcileAction::done())
            }
            Err(SchedulerError::Unschedulable(message)) => {
                let current = get_condition(&pod.status.conditions, CONDITION_SCHEDULED);
                if current.is_none_or(|c| c.status || c.message != message) {
                    debug!(pod = %key, %message, "pod unschedulable");
                    let mut updated = object.clone();
                    if let Some(p) = updated.as_pod_mut() {
                        set_condition(
                            &mut p.status.conditions,
                            Condition::new(CONDITION_SCHEDULED, false, "Unschedulable", message),
                        );
                    }
                    self.store.update(updated)?;
                }
                Ok(ReconcileAction::done())
            }
        }
    }
}
