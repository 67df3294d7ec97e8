//! ReplicaSet reconciliation.
//!
//! Converges the set of owned, non-terminating pods onto the spec's
//! replica count: missing pods are stamped out from the template and left
//! for the scheduler, surplus pods are deleted by a deterministic ranking
//! that minimizes availability loss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use tiller_api::{
    set_condition, Condition, Kind, Object, ObjectKey, Payload, PodObject, PodStatus,
};
use tiller_runtime::{ReconcileAction, ReconcileError, Reconciler};
use tiller_store::{ObjectStore, StoreError, WatchEvent, WatchFilter};
use tracing::info;

use super::{controller_ref, generated_name, mark_degraded, owner_key};

pub struct ReplicaSetController {
    store: ObjectStore,
}

impl ReplicaSetController {
    #[must_use]
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    fn update_status(
        &self,
        object: &Object,
        observed: u32,
        ready: u32,
    ) -> Result<(), StoreError> {
        let Some(rs) = object.as_replica_set() else {
            return Ok(());
        };
        let mut status = rs.status.clone();
        status.replicas = observed;
        status.ready_replicas = ready;
        let desired = rs.spec.replicas;
        let settled = observed == desired && ready == desired;
        set_condition(
            &mut status.conditions,
            if settled {
                Condition::new("Ready", true, "AllReplicasReady", "")
            } else {
                Condition::new(
                    "Ready",
                    false,
                    "Reconciling",
                    format!("{ready}/{desired} replicas ready"),
                )
            },
        );

        if status == rs.status {
            return Ok(());
        }
        let mut updated = object.clone();
        if let Some(rs) = updated.as_replica_set_mut() {
            rs.status = status;
        }
        self.store.update(updated)?;
        Ok(())
    }
}

/// Deletion preference: not-ready first, then unscheduled, then newest.
/// The trailing name keeps the order total.
fn deletion_rank(object: &Object) -> (bool, bool, Reverse<DateTime<Utc>>, String) {
    let pod = object.as_pod();
    (
        pod.is_some_and(|p| p.status.ready),
        pod.is_some_and(|p| p.spec.node_name.is_some()),
        Reverse(object.meta.creation_timestamp),
        object.meta.name.clone(),
    )
}

#[async_trait]
impl Reconciler for ReplicaSetController {
    fn name(&self) -> &'static str {
        "replicaset"
    }

    fn watches(&self) -> Vec<WatchFilter> {
        vec![
            WatchFilter::kind(Kind::ReplicaSet),
            WatchFilter::kind(Kind::Pod),
        ]
    }

    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match event.object.kind() {
            Kind::ReplicaSet => vec![event.key()],
            Kind::Pod => owner_key(&event.object, Kind::ReplicaSet).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let object = match self.store.get(key) {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => return Ok(ReconcileAction::done()),
            Err(err) => return Err(err.into()),
        };
        let Some(rs) = object.as_replica_set() else {
            return Ok(ReconcileAction::done());
        };
        if object.meta.is_deleting() {
            return Ok(ReconcileAction::done());
        }

        let desired = rs.spec.replicas;
        let pods = self
            .store
            .list(Kind::Pod, Some(&object.meta.namespace), Some(&rs.spec.selector));
        let mut active: Vec<&Object> = pods
            .iter()
            .filter(|p| p.meta.owned_by(object.meta.uid))
            .filter(|p| !p.meta.is_deleting() && p.as_pod().is_some_and(PodObject::is_active))
            .collect();
        let observed = active.len() as u32;
        let ready = active
            .iter()
            .filter(|p| p.as_pod().is_some_and(|pod| pod.status.ready))
            .count() as u32;

        if observed < desired {
            let missing = desired - observed;
            info!(replicaset = %key, missing, "creating pods");
            for _ in 0..missing {
                let mut pod = Object::new(
                    &object.meta.namespace,
                    generated_name(&object.meta.name),
                    Payload::Pod(PodObject {
                        spec: rs.spec.template.spec.clone(),
                        status: PodStatus::default(),
                    }),
                );
                pod.meta.labels = rs.spec.template.labels.clone();
                pod.meta.owner_references.push(controller_ref(&object, true));
                self.store.create(pod)?;
            }
        } else if observed > desired {
            let surplus = (observed - desired) as usize;
            active.sort_by_key(|p| deletion_rank(p));
            info!(replicaset = %key, surplus, "deleting surplus pods");
            for victim in active.iter().take(surplus) {
                self.store.mark_for_deletion(&victim.key())?;
            }
        }

        self.update_status(&object, observed, ready)?;
        Ok(ReconcileAction::done())
    }

    fn on_retries_exhausted(&self, key: &ObjectKey) {
        mark_degraded(&self.store, key, "replica reconciliation kept failing");
    }
}
