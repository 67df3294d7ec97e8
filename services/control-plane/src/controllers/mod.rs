//! Reconciliation controllers.
//!
//! Each controller watches a subset of object kinds and drives observed
//! state toward desired state. Controllers share nothing but the store;
//! everything here is built on the `tiller-runtime` reconcile loop.

pub mod autoscaler;
pub mod deployment;
pub mod gc;
pub mod replicaset;
pub mod statefulset;
pub mod volumebinder;

pub use autoscaler::AutoscalerController;
pub use deployment::{rollback, DeploymentController};
pub use gc::GcController;
pub use replicaset::ReplicaSetController;
pub use statefulset::StatefulSetController;
pub use volumebinder::VolumeBinderController;

use rand::Rng;
use tiller_api::{
    set_condition, Condition, Kind, Object, ObjectKey, OwnerReference, Payload,
};
use tiller_store::ObjectStore;
use tracing::warn;

/// Label stamped on children recording the template revision they were
/// created from.
pub const LABEL_TEMPLATE_HASH: &str = "tiller.io/template-hash";

/// Label stamped on stateful set pods recording their ordinal.
pub const LABEL_ORDINAL: &str = "tiller.io/pod-ordinal";

/// Condition type set when a controller exhausts its retry budget.
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Builds the controller owner reference for a child of `owner`.
pub(crate) fn controller_ref(owner: &Object, cascade: bool) -> OwnerReference {
    OwnerReference {
        kind: owner.kind(),
        name: owner.meta.name.clone(),
        uid: owner.meta.uid,
        controller: true,
        cascade,
    }
}

/// Mutable access to the status conditions of any payload. Volumes carry
/// no conditions; their phase is the whole story.
pub(crate) fn conditions_mut(object: &mut Object) -> Option<&mut Vec<Condition>> {
    match &mut object.payload {
        Payload::Pod(o) => Some(&mut o.status.conditions),
        Payload::Node(o) => Some(&mut o.status.conditions),
        Payload::ReplicaSet(o) => Some(&mut o.status.conditions),
        Payload::Deployment(o) => Some(&mut o.status.conditions),
        Payload::StatefulSet(o) => Some(&mut o.status.conditions),
        Payload::PersistentVolumeClaim(o) => Some(&mut o.status.conditions),
        Payload::HorizontalPodAutoscaler(o) => Some(&mut o.status.conditions),
        Payload::PersistentVolume(_) => None,
    }
}

/// Surfaces an exhausted retry budget as a degraded condition on the
/// object. Best effort: the object may be gone, and a racing write loses.
pub(crate) fn mark_degraded(store: &ObjectStore, key: &ObjectKey, message: &str) {
    warn!(key = %key, message, "retry budget exhausted");
    let Ok(mut object) = store.get(key) else { return };
    if let Some(conditions) = conditions_mut(&mut object) {
        set_condition(
            conditions,
            Condition::new(CONDITION_DEGRADED, true, "RetriesExhausted", message),
        );
        let _ = store.update(object);
    }
}

/// Generates a child name: `{prefix}-{5 random lowercase alphanumerics}`.
pub(crate) fn generated_name(prefix: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..5)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{prefix}-{suffix}")
}

/// Maps a child event to its controller's key, if the controller is of the
/// expected kind.
pub(crate) fn owner_key(child: &Object, owner_kind: Kind) -> Option<ObjectKey> {
    let reference = child.meta.controller_ref()?;
    if reference.kind != owner_kind {
        return None;
    }
    Some(ObjectKey::new(
        owner_kind,
        child.meta.namespace.clone(),
        reference.name.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_api::{Payload, PodObject, PodSpec};

    #[test]
    fn generated_names_are_name_safe() {
        let name = generated_name("web");
        assert!(name.starts_with("web-"));
        assert_eq!(name.len(), 9);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn owner_key_requires_matching_kind() {
        let mut pod = Object::new(
            "default",
            "web-abc12",
            Payload::Pod(PodObject {
                spec: PodSpec::default(),
                status: Default::default(),
            }),
        );
        assert!(owner_key(&pod, Kind::ReplicaSet).is_none());

        pod.meta.owner_references.push(OwnerReference {
            kind: Kind::ReplicaSet,
            name: "web".to_string(),
            uid: tiller_api::Uid::new(),
            controller: true,
            cascade: true,
        });
        let key = owner_key(&pod, Kind::ReplicaSet).unwrap();
        assert_eq!(key, ObjectKey::new(Kind::ReplicaSet, "default", "web"));
        assert!(owner_key(&pod, Kind::StatefulSet).is_none());
    }
}
