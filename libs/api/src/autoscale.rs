//! Horizontal autoscaler types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::meta::Kind;

/// The scalable workload an autoscaler manages, in its own namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: Kind,
    pub name: String,
}

/// One metric the autoscaler tracks.
///
/// Desired replicas for a metric are
/// `ceil(current_replicas * current_value / target_value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric name resolved through the external metrics source, e.g.
    /// `cpu_utilization_percent`.
    pub name: String,

    pub target_value: f64,
}

fn default_scale_up_percent() -> u32 {
    100
}

fn default_scale_up_pods() -> u32 {
    4
}

/// Rate limit applied to upward scaling within one evaluation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpPolicy {
    /// Max growth as a percentage of current replicas.
    #[serde(default = "default_scale_up_percent")]
    pub max_percent: u32,

    /// Max growth as an absolute pod count.
    #[serde(default = "default_scale_up_pods")]
    pub max_pods: u32,
}

impl Default for ScaleUpPolicy {
    fn default() -> Self {
        Self {
            max_percent: default_scale_up_percent(),
            max_pods: default_scale_up_pods(),
        }
    }
}

fn default_stabilization_seconds() -> u64 {
    300
}

/// Scaling behavior knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingBehavior {
    #[serde(default)]
    pub scale_up: ScaleUpPolicy,

    /// A lower recommendation must hold for this long before it is applied;
    /// the effective value is the max over the trailing window.
    #[serde(default = "default_stabilization_seconds")]
    pub scale_down_stabilization_seconds: u64,
}

impl Default for ScalingBehavior {
    fn default() -> Self {
        Self {
            scale_up: ScaleUpPolicy::default(),
            scale_down_stabilization_seconds: default_stabilization_seconds(),
        }
    }
}

/// Desired state of a horizontal autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpaSpec {
    pub target_ref: TargetRef,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub metrics: Vec<MetricSpec>,

    #[serde(default)]
    pub behavior: ScalingBehavior,
}

/// Observed state of a horizontal autoscaler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HpaStatus {
    #[serde(default)]
    pub current_replicas: u32,

    #[serde(default)]
    pub desired_replicas: u32,

    #[serde(default)]
    pub last_scale_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A horizontal autoscaler object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpaObject {
    pub spec: HpaSpec,

    #[serde(default)]
    pub status: HpaStatus,
}
