//! Typed object model for the tiller orchestration core.
//!
//! Every piece of desired and observed state lives in an [`Object`]: a
//! metadata envelope plus a kind-specific payload. Objects are stored and
//! versioned by `tiller-store`; controllers only ever exchange state through
//! that store, so the types here are plain data with no behavior beyond
//! validation and small helpers.

pub mod autoscale;
pub mod conditions;
pub mod error;
pub mod labels;
pub mod meta;
pub mod object;
pub mod resources;
pub mod storage;
pub mod workload;

pub use autoscale::{HpaObject, HpaSpec, HpaStatus, MetricSpec, ScaleUpPolicy, ScalingBehavior, TargetRef};
pub use conditions::{get_condition, set_condition, Condition};
pub use error::ValidationError;
pub use labels::{LabelSelector, Labels, SelectorOperator, SelectorRequirement};
pub use meta::{Kind, ObjectKey, ObjectMeta, OwnerReference, Uid, DEFAULT_NAMESPACE};
pub use object::{Object, Payload};
pub use resources::ResourceSet;
pub use storage::{
    AccessMode, ClaimRef, PvObject, PvPhase, PvSpec, PvStatus, PvcObject, PvcPhase, PvcSpec,
    PvcStatus, ReclaimPolicy, VolumeClaimTemplate,
};
pub use workload::{
    DeploymentObject, DeploymentSpec, DeploymentStatus, NodeAffinity, NodeObject, NodeSpec,
    NodeStatus, PodAffinityTerm, PodAntiAffinity, PodObject, PodPhase, PodSpec, PodStatus,
    PodTemplate, PvcRetentionPolicy, ReplicaSetObject, ReplicaSetSpec, ReplicaSetStatus,
    RolloutPhase, RolloutStrategy, StatefulSetObject, StatefulSetSpec, StatefulSetStatus, Taint,
    TaintEffect, WeightedNodeTerm, WeightedPodTerm,
};
