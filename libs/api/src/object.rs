//! The object envelope: metadata plus a kind-specific payload.

use serde::{Deserialize, Serialize};

use crate::autoscale::HpaObject;
use crate::error::ValidationError;
use crate::meta::{Kind, ObjectKey, ObjectMeta};
use crate::storage::{PvObject, PvcObject};
use crate::workload::{
    DeploymentObject, NodeObject, PodObject, PodTemplate, ReplicaSetObject, StatefulSetObject,
};

/// Kind-specific object state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Pod(PodObject),
    Node(NodeObject),
    ReplicaSet(ReplicaSetObject),
    Deployment(DeploymentObject),
    StatefulSet(StatefulSetObject),
    PersistentVolumeClaim(PvcObject),
    PersistentVolume(PvObject),
    HorizontalPodAutoscaler(HpaObject),
}

impl Payload {
    /// The kind this payload belongs to.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Pod(_) => Kind::Pod,
            Payload::Node(_) => Kind::Node,
            Payload::ReplicaSet(_) => Kind::ReplicaSet,
            Payload::Deployment(_) => Kind::Deployment,
            Payload::StatefulSet(_) => Kind::StatefulSet,
            Payload::PersistentVolumeClaim(_) => Kind::PersistentVolumeClaim,
            Payload::PersistentVolume(_) => Kind::PersistentVolume,
            Payload::HorizontalPodAutoscaler(_) => Kind::HorizontalPodAutoscaler,
        }
    }
}

/// A complete object: envelope plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub meta: ObjectMeta,

    #[serde(flatten)]
    pub payload: Payload,
}

macro_rules! payload_accessors {
    ($($as_fn:ident, $as_mut_fn:ident, $variant:ident, $ty:ty;)*) => {
        $(
            #[doc = concat!("Borrows the payload if this is a ", stringify!($variant), ".")]
            #[must_use]
            pub fn $as_fn(&self) -> Option<&$ty> {
                match &self.payload {
                    Payload::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            #[must_use]
            pub fn $as_mut_fn(&mut self) -> Option<&mut $ty> {
                match &mut self.payload {
                    Payload::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        )*
    };
}

impl Object {
    /// Creates a namespaced object ready for submission. Uid and version
    /// are assigned by the store.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            payload,
        }
    }

    /// Creates a cluster-scoped object (empty namespace).
    pub fn cluster_scoped(name: impl Into<String>, payload: Payload) -> Self {
        Self::new("", name, payload)
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.payload.kind()
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.meta.namespace.clone(), self.meta.name.clone())
    }

    payload_accessors! {
        as_pod, as_pod_mut, Pod, PodObject;
        as_node, as_node_mut, Node, NodeObject;
        as_replica_set, as_replica_set_mut, ReplicaSet, ReplicaSetObject;
        as_deployment, as_deployment_mut, Deployment, DeploymentObject;
        as_stateful_set, as_stateful_set_mut, StatefulSet, StatefulSetObject;
        as_pvc, as_pvc_mut, PersistentVolumeClaim, PvcObject;
        as_pv, as_pv_mut, PersistentVolume, PvObject;
        as_hpa, as_hpa_mut, HorizontalPodAutoscaler, HpaObject;
    }

    /// Validates required fields before admission to the store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.meta.name)?;
        let kind = self.kind();
        if kind.is_cluster_scoped() {
            if !self.meta.namespace.is_empty() {
                return Err(ValidationError::InvalidNamespace {
                    namespace: self.meta.namespace.clone(),
                    kind,
                    reason: "kind is cluster scoped",
                });
            }
        } else if self.meta.namespace.is_empty() {
            return Err(ValidationError::InvalidNamespace {
                namespace: String::new(),
                kind,
                reason: "namespace is required",
            });
        }

        match &self.payload {
            Payload::Pod(pod) => {
                if pod.spec.image.is_empty() {
                    return Err(ValidationError::MissingField("spec.image"));
                }
            }
            Payload::Node(node) => {
                if node.spec.allocatable.cpu_millis == 0 || node.spec.allocatable.memory_bytes == 0
                {
                    return Err(ValidationError::Invalid(
                        "node allocatable cpu and memory must be non-zero",
                    ));
                }
            }
            Payload::ReplicaSet(rs) => {
                validate_workload_template(&rs.spec.selector, &rs.spec.template)?;
            }
            Payload::Deployment(deploy) => {
                validate_workload_template(&deploy.spec.selector, &deploy.spec.template)?;
            }
            Payload::StatefulSet(set) => {
                validate_workload_template(&set.spec.selector, &set.spec.template)?;
                if set.spec.service_name.is_empty() {
                    return Err(ValidationError::MissingField("spec.service_name"));
                }
                if set.spec.volume_claim_template.name.is_empty() {
                    return Err(ValidationError::MissingField("spec.volume_claim_template.name"));
                }
                if set.spec.volume_claim_template.request_bytes == 0 {
                    return Err(ValidationError::Invalid("claim template request must be non-zero"));
                }
            }
            Payload::PersistentVolumeClaim(claim) => {
                if claim.spec.request_bytes == 0 {
                    return Err(ValidationError::Invalid("claim request must be non-zero"));
                }
                if claim.spec.access_modes.is_empty() {
                    return Err(ValidationError::MissingField("spec.access_modes"));
                }
            }
            Payload::PersistentVolume(volume) => {
                if volume.spec.capacity_bytes == 0 {
                    return Err(ValidationError::Invalid("volume capacity must be non-zero"));
                }
                if volume.spec.access_modes.is_empty() {
                    return Err(ValidationError::MissingField("spec.access_modes"));
                }
            }
            Payload::HorizontalPodAutoscaler(hpa) => {
                if hpa.spec.min_replicas == 0 || hpa.spec.min_replicas > hpa.spec.max_replicas {
                    return Err(ValidationError::ReplicaBounds {
                        min: hpa.spec.min_replicas,
                        max: hpa.spec.max_replicas,
                    });
                }
                if hpa.spec.metrics.is_empty() {
                    return Err(ValidationError::MissingField("spec.metrics"));
                }
                for metric in &hpa.spec.metrics {
                    if metric.target_value <= 0.0 {
                        return Err(ValidationError::NonPositiveTarget(metric.name.clone()));
                    }
                }
            }
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: "name must not be empty",
        });
    }
    if name.len() > 253 {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: "name exceeds 253 characters",
        });
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: "name must be lowercase alphanumeric segments separated by dashes",
        });
    }
    Ok(())
}

fn validate_workload_template(
    selector: &crate::labels::LabelSelector,
    template: &PodTemplate,
) -> Result<(), ValidationError> {
    if selector.is_empty() {
        return Err(ValidationError::EmptySelector);
    }
    if !selector.matches(&template.labels) {
        return Err(ValidationError::SelectorMismatch);
    }
    if template.spec.image.is_empty() {
        return Err(ValidationError::MissingField("template.spec.image"));
    }
    Ok(())
}
