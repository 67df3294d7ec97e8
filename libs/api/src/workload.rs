//! Workload object types: pods, nodes, and the controllers that own pods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::labels::{LabelSelector, Labels};
use crate::resources::ResourceSet;
use crate::storage::VolumeClaimTemplate;

// =============================================================================
// Pods
// =============================================================================

/// Pod lifecycle phase, as reported by the node runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodPhase::Pending => "pending",
            PodPhase::Running => "running",
            PodPhase::Succeeded => "succeeded",
            PodPhase::Failed => "failed",
            PodPhase::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A node-affinity term weighted for scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedNodeTerm {
    pub weight: u32,
    pub selector: LabelSelector,
}

/// Node affinity constraints on a pod.
///
/// `required` terms are or-ed: a node is eligible if any term matches its
/// labels. `preferred` terms add their weight to the node's score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffinity {
    #[serde(default)]
    pub required: Vec<LabelSelector>,

    #[serde(default)]
    pub preferred: Vec<WeightedNodeTerm>,
}

/// One anti-affinity term: pods matching `selector` repel within the
/// topology domain named by `topology_key` (a node label key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    pub selector: LabelSelector,
    pub topology_key: String,
}

/// An anti-affinity term weighted for scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedPodTerm {
    pub weight: u32,
    pub term: PodAffinityTerm,
}

/// Pod anti-affinity constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAntiAffinity {
    #[serde(default)]
    pub required: Vec<PodAffinityTerm>,

    #[serde(default)]
    pub preferred: Vec<WeightedPodTerm>,
}

/// Desired state of one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    /// Resources requested from the hosting node.
    #[serde(default)]
    pub resources: ResourceSet,

    /// Assigned by the scheduler; None until the pod is bound.
    #[serde(default)]
    pub node_name: Option<String>,

    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,

    #[serde(default)]
    pub anti_affinity: Option<PodAntiAffinity>,

    /// Name of a persistent volume claim mounted by this pod.
    #[serde(default)]
    pub volume_claim: Option<String>,
}

/// Observed state of one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,

    /// Latest readiness probe outcome.
    #[serde(default)]
    pub ready: bool,

    /// When readiness last transitioned false to true. Cleared when the pod
    /// stops being ready. Backs the minimum-ready-duration gate.
    #[serde(default)]
    pub ready_since: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A pod object: spec plus status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodObject {
    pub spec: PodSpec,

    #[serde(default)]
    pub status: PodStatus,
}

impl PodObject {
    /// Returns true while the pod still counts against its owner's replica
    /// total: it exists, is not terminating, and has not run to completion.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Readiness that has held for at least `min_ready_seconds`.
    #[must_use]
    pub fn is_available(&self, min_ready_seconds: u32, now: DateTime<Utc>) -> bool {
        if !self.status.ready {
            return false;
        }
        match self.status.ready_since {
            Some(since) => {
                now.signed_duration_since(since).num_seconds() >= i64::from(min_ready_seconds)
            }
            // Ready with no transition record: treat as just transitioned.
            None => min_ready_seconds == 0,
        }
    }
}

/// A pod template stamped out by workload controllers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: Labels,

    pub spec: PodSpec,
}

// =============================================================================
// Nodes
// =============================================================================

/// Taint effect on scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintEffect {
    /// Node is excluded from placement entirely.
    NoSchedule,
    /// Node is penalized during scoring but remains eligible.
    PreferNoSchedule,
}

/// A taint repelling pods from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

/// Desired/declared state of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Resources available for pod placement after system reservations.
    pub allocatable: ResourceSet,

    #[serde(default)]
    pub taints: Vec<Taint>,
}

/// Observed state of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A node object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeObject {
    pub spec: NodeSpec,

    #[serde(default)]
    pub status: NodeStatus,
}

// =============================================================================
// ReplicaSets
// =============================================================================

/// Desired state of a replica set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    pub selector: LabelSelector,
    pub template: PodTemplate,
    pub replicas: u32,
}

/// Observed state of a replica set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    /// Active owned pods observed at the last reconciliation.
    #[serde(default)]
    pub replicas: u32,

    #[serde(default)]
    pub ready_replicas: u32,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A replica set object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetObject {
    pub spec: ReplicaSetSpec,

    #[serde(default)]
    pub status: ReplicaSetStatus,
}

// =============================================================================
// Deployments
// =============================================================================

/// Bounds on how far a rollout may diverge from the desired replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStrategy {
    /// Pods allowed above the desired count during a rollout.
    pub max_surge: u32,

    /// Pods allowed to be unavailable during a rollout.
    pub max_unavailable: u32,
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

/// Rollout state machine phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    #[default]
    Progressing,
    Paused,
    Complete,
    Failed,
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutPhase::Progressing => "progressing",
            RolloutPhase::Paused => "paused",
            RolloutPhase::Complete => "complete",
            RolloutPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

fn default_progress_deadline() -> u32 {
    600
}

fn default_history_limit() -> u32 {
    10
}

/// Desired state of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub selector: LabelSelector,
    pub template: PodTemplate,
    pub replicas: u32,

    #[serde(default)]
    pub strategy: RolloutStrategy,

    /// Seconds a pod must stay ready before it counts as available.
    #[serde(default)]
    pub min_ready_seconds: u32,

    /// Seconds without rollout progress before the rollout is reported
    /// failed. Failure is reported, never auto-reverted.
    #[serde(default = "default_progress_deadline")]
    pub progress_deadline_seconds: u32,

    /// While paused, the rollout engine makes no scaling moves.
    #[serde(default)]
    pub paused: bool,

    /// Retired replica sets kept around (at zero replicas) for rollback.
    #[serde(default = "default_history_limit")]
    pub revision_history_limit: u32,
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self {
            selector: LabelSelector::default(),
            template: PodTemplate::default(),
            replicas: 0,
            strategy: RolloutStrategy::default(),
            min_ready_seconds: 0,
            progress_deadline_seconds: default_progress_deadline(),
            paused: false,
            revision_history_limit: default_history_limit(),
        }
    }
}

/// Observed state of a deployment rollout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub phase: RolloutPhase,

    /// Pods from the current-template replica set.
    #[serde(default)]
    pub updated_replicas: u32,

    #[serde(default)]
    pub ready_replicas: u32,

    /// When the rollout last made forward progress; drives the deadline.
    #[serde(default)]
    pub last_progress_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A deployment object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentObject {
    pub spec: DeploymentSpec,

    #[serde(default)]
    pub status: DeploymentStatus,
}

// =============================================================================
// StatefulSets
// =============================================================================

/// What happens to per-ordinal claims when the set is deleted with cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvcRetentionPolicy {
    /// Claims survive the set; backing data is kept.
    #[default]
    Retain,
    /// Claims are garbage-collected along with the set.
    Delete,
}

/// Desired state of a stateful set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulSetSpec {
    /// Governing service name; part of each ordinal's stable identity.
    pub service_name: String,

    pub selector: LabelSelector,
    pub template: PodTemplate,
    pub replicas: u32,

    pub volume_claim_template: VolumeClaimTemplate,

    #[serde(default)]
    pub pvc_retention: PvcRetentionPolicy,
}

/// Observed state of a stateful set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulSetStatus {
    /// Ordinal pods that currently exist.
    #[serde(default)]
    pub replicas: u32,

    #[serde(default)]
    pub ready_replicas: u32,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A stateful set object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulSetObject {
    pub spec: StatefulSetSpec,

    #[serde(default)]
    pub status: StatefulSetStatus,
}
