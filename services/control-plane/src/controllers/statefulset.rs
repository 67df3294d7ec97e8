//! StatefulSet reconciliation.
//!
//! Ordinal pods and their claims move strictly in order, one mutation in
//! flight per set: scale-up creates ordinal `i` only once `i-1` is running
//! and ready, scale-down retires the highest ordinal and waits for it to
//! terminate fully, and a template change recreates ordinals in descending
//! order behind the same readiness barrier. Claims are created once per
//! ordinal and survive pod recreation; only set deletion with cascade
//! honors the retention policy recorded on the claim's owner reference.

use async_trait::async_trait;
use tiller_api::{
    set_condition, Condition, Kind, Object, ObjectKey, OwnerReference, Payload, PodObject,
    PodPhase, PodStatus, PvcObject, PvcRetentionPolicy, PvcSpec, StatefulSetObject,
};
use tiller_runtime::{ReconcileAction, ReconcileError, Reconciler, SpecHash};
use tiller_store::{ObjectStore, StoreError, WatchEvent, WatchFilter};
use tracing::info;

use super::{controller_ref, mark_degraded, owner_key, LABEL_ORDINAL, LABEL_TEMPLATE_HASH};

pub struct StatefulSetController {
    store: ObjectStore,
}

impl StatefulSetController {
    #[must_use]
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Creates the ordinal's claim if it does not exist yet. The cascade
    /// flag on the owner reference records the retention policy at
    /// creation time; the controller itself never deletes claims.
    fn ensure_claim(
        &self,
        owner: &Object,
        set: &StatefulSetObject,
        ordinal: u32,
    ) -> Result<String, StoreError> {
        let template = &set.spec.volume_claim_template;
        let name = format!("{}-{}-{}", template.name, owner.meta.name, ordinal);
        let key = ObjectKey::new(
            Kind::PersistentVolumeClaim,
            owner.meta.namespace.clone(),
            name.clone(),
        );
        match self.store.get(&key) {
            Ok(_) => return Ok(name),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let mut claim = Object::new(
            &owner.meta.namespace,
            &name,
            Payload::PersistentVolumeClaim(PvcObject {
                spec: PvcSpec {
                    storage_class: template.storage_class.clone(),
                    access_modes: template.access_modes.clone(),
                    request_bytes: template.request_bytes,
                },
                status: Default::default(),
            }),
        );
        claim.meta.labels = set.spec.template.labels.clone();
        claim.meta.labels.insert(LABEL_ORDINAL, ordinal.to_string());
        claim.meta.owner_references.push(OwnerReference {
            kind: Kind::StatefulSet,
            name: owner.meta.name.clone(),
            uid: owner.meta.uid,
            controller: false,
            cascade: set.spec.pvc_retention == PvcRetentionPolicy::Delete,
        });
        info!(claim = %key, "creating ordinal claim");
        self.store.create(claim)?;
        Ok(name)
    }

    fn create_ordinal_pod(
        &self,
        owner: &Object,
        set: &StatefulSetObject,
        ordinal: u32,
        hash: &SpecHash,
    ) -> Result<(), StoreError> {
        let claim_name = self.ensure_claim(owner, set, ordinal)?;
        let name = format!("{}-{}", owner.meta.name, ordinal);

        let mut spec = set.spec.template.spec.clone();
        spec.volume_claim = Some(claim_name);
        let mut pod = Object::new(
            &owner.meta.namespace,
            &name,
            Payload::Pod(PodObject {
                spec,
                status: PodStatus::default(),
            }),
        );
        pod.meta.labels = set.spec.template.labels.clone();
        pod.meta.labels.insert(LABEL_ORDINAL, ordinal.to_string());
        pod.meta.labels.insert(LABEL_TEMPLATE_HASH, hash.as_str());
        pod.meta.owner_references.push(controller_ref(owner, true));
        info!(pod = %pod.key(), ordinal, "creating ordinal pod");
        self.store.create(pod)?;
        Ok(())
    }

    fn update_status(&self, object: &Object, pods: &[(u32, &Object)]) -> Result<(), StoreError> {
        let Some(set) = object.as_stateful_set() else {
            return Ok(());
        };
        let observed = pods.len() as u32;
        let ready = pods
            .iter()
            .filter(|(_, p)| p.as_pod().is_some_and(|pod| pod.status.ready))
            .count() as u32;

        let mut status = set.status.clone();
        status.replicas = observed;
        status.ready_replicas = ready;
        let desired = set.spec.replicas;
        set_condition(
            &mut status.conditions,
            if observed == desired && ready == desired {
                Condition::new("Ready", true, "AllOrdinalsReady", "")
            } else {
                Condition::new(
                    "Ready",
                    false,
                    "Reconciling",
                    format!("{ready}/{desired} ordinals ready"),
                )
            },
        );
        if status == set.status {
            return Ok(());
        }
        let mut updated = object.clone();
        if let Some(s) = updated.as_stateful_set_mut() {
            s.status = status;
        }
        self.store.update(updated)?;
        Ok(())
    }
}

fn ordinal_of(object: &Object) -> Option<u32> {
    object
        .meta
        .labels
        .get(LABEL_ORDINAL)
        .and_then(|v| v.parse().ok())
}

fn is_running_and_ready(object: &Object) -> bool {
    object
        .as_pod()
        .is_some_and(|p| p.status.phase == PodPhase::Running && p.status.ready)
}

#[async_trait]
impl Reconciler for StatefulSetController {
    fn name(&self) -> &'static str {
        "statefulset"
    }

    fn watches(&self) -> Vec<WatchFilter> {
        vec![
            WatchFilter::kind(Kind::StatefulSet),
            WatchFilter::kind(Kind::Pod),
        ]
    }

    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match event.object.kind() {
            Kind::StatefulSet => vec![event.key()],
            Kind::Pod => owner_key(&event.object, Kind::StatefulSet)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let object = match self.store.get(key) {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => return Ok(ReconcileAction::done()),
            Err(err) => return Err(err.into()),
        };
        let Some(set) = object.as_stateful_set() else {
            return Ok(ReconcileAction::done());
        };
        if object.meta.is_deleting() {
            return Ok(ReconcileAction::done());
        }

        let hash = SpecHash::of(&set.spec.template);
        let all = self
            .store
            .list(Kind::Pod, Some(&object.meta.namespace), Some(&set.spec.selector));
        let owned: Vec<&Object> = all
            .iter()
            .filter(|p| p.meta.owned_by(object.meta.uid))
            .collect();

        // A terminating pod is the one in-flight mutation; its removal
        // event resumes the walk.
        if owned.iter().any(|p| p.meta.is_deleting()) {
            let pods: Vec<(u32, &Object)> = owned
                .iter()
                .filter(|p| !p.meta.is_deleting())
                .filter_map(|p| ordinal_of(p).map(|o| (o, *p)))
                .collect();
            self.update_status(&object, &pods)?;
            return Ok(ReconcileAction::done());
        }

        let mut pods: Vec<(u32, &Object)> = owned
            .iter()
            .filter_map(|p| ordinal_of(p).map(|o| (o, *p)))
            .collect();
        pods.sort_by_key(|(ordinal, _)| *ordinal);

        // Scale down: the highest ordinal goes first, alone.
        if let Some(&(highest, victim)) = pods.last() {
            if highest >= set.spec.replicas {
                info!(statefulset = %key, ordinal = highest, "retiring highest ordinal");
                self.store.mark_for_deletion(&victim.key())?;
                self.update_status(&object, &pods)?;
                return Ok(ReconcileAction::done());
            }
        }

        // Scale up in ascending order behind the readiness barrier.
        for ordinal in 0..set.spec.replicas {
            match pods.iter().find(|(o, _)| *o == ordinal) {
                None => {
                    self.create_ordinal_pod(&object, set, ordinal, &hash)?;
                    self.update_status(&object, &pods)?;
                    return Ok(ReconcileAction::done());
                }
                Some((_, pod)) => {
                    if !is_running_and_ready(pod) {
                        self.update_status(&object, &pods)?;
                        return Ok(ReconcileAction::done());
                    }
                }
            }
        }

        // Every ordinal exists and is ready: recreate stale revisions in
        // descending order, preserving each ordinal's claim.
        for &(ordinal, pod) in pods.iter().rev() {
            if pod.meta.labels.get(LABEL_TEMPLATE_HASH) != Some(hash.as_str()) {
                info!(statefulset = %key, ordinal, "recreating ordinal for updated template");
                self.store.mark_for_deletion(&pod.key())?;
                self.update_status(&object, &pods)?;
                return Ok(ReconcileAction::done());
            }
        }

        self.update_status(&object, &pods)?;
        Ok(ReconcileAction::done())
    }

    fn on_retries_exhausted(&self, key: &ObjectKey) {
        mark_degraded(&self.store, key, "ordinal reconciliation kept failing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_api::{
        AccessMode, LabelSelector, Labels, PodSpec, PodTemplate, StatefulSetSpec,
        VolumeClaimTemplate,
    };

    fn stateful_set(name: &str, replicas: u32, retention: PvcRetentionPolicy) -> Object {
        Object::new(
            "default",
            name,
            Payload::StatefulSet(StatefulSetObject {
                spec: StatefulSetSpec {
                    service_name: name.to_string(),
                    selector: LabelSelector::from_labels([("app", name)]),
                    template: PodTemplate {
                        labels: Labels::from([("app", name)]),
                        spec: PodSpec {
                            image: "registry/db:v1".to_string(),
                            ..PodSpec::default()
                        },
                    },
                    replicas,
                    volume_claim_template: VolumeClaimTemplate {
                        name: "data".to_string(),
                        storage_class: "ssd".to_string(),
                        access_modes: vec![AccessMode::ReadWriteOnce],
                        request_bytes: 1 << 30,
                    },
                    pvc_retention: retention,
                },
                status: Default::default(),
            }),
        )
    }

    fn mark_ready(store: &ObjectStore, namespace: &str, name: &str) {
        let key = ObjectKey::new(Kind::Pod, namespace, name);
        let mut pod = store.get(&key).unwrap();
        {
            let p = pod.as_pod_mut().unwrap();
            p.spec.node_name = Some("worker-1".to_string());
            p.status.phase = PodPhase::Running;
            p.status.ready = true;
        }
        store.update(pod).unwrap();
    }

    fn pod_names(store: &ObjectStore) -> Vec<String> {
        store
            .list(Kind::Pod, Some("default"), None)
            .into_iter()
            .filter(|p| !p.meta.is_deleting())
            .map(|p| p.meta.name)
            .collect()
    }

    #[tokio::test]
    async fn scale_up_is_ordinal_ordered_behind_readiness() {
        let store = ObjectStore::new();
        let controller = StatefulSetController::new(store.clone());
        let created = store
            .create(stateful_set("db", 3, PvcRetentionPolicy::Retain))
            .unwrap();

        // Only ordinal 0 appears, no matter how often we reconcile.
        controller.reconcile(&created.key()).await.unwrap();
        controller.reconcile(&created.key()).await.unwrap();
        assert_eq!(pod_names(&store), vec!["db-0"]);
        let claim_key = ObjectKey::new(Kind::PersistentVolumeClaim, "default", "data-db-0");
        assert!(store.get(&claim_key).is_ok());

        // Ordinal 1 only follows once 0 is running and ready.
        mark_ready(&store, "default", "db-0");
        controller.reconcile(&created.key()).await.unwrap();
        assert_eq!(pod_names(&store), vec!["db-0", "db-1"]);

        mark_ready(&store, "default", "db-1");
        controller.reconcile(&created.key()).await.unwrap();
        assert_eq!(pod_names(&store), vec!["db-0", "db-1", "db-2"]);

        let pod = store
            .get(&ObjectKey::new(Kind::Pod, "default", "db-2"))
            .unwrap();
        assert_eq!(
            pod.as_pod().unwrap().spec.volume_claim.as_deref(),
            Some("data-db-2")
        );
    }

    #[tokio::test]
    async fn scale_down_retires_highest_and_waits_for_termination() {
        let store = ObjectStore::new();
        let controller = StatefulSetController::new(store.clone());
        let created = store
            .create(stateful_set("db", 3, PvcRetentionPolicy::Retain))
            .unwrap();
        for ordinal in 0..3 {
            controller.reconcile(&created.key()).await.unwrap();
            mark_ready(&store, "default", &format!("db-{ordinal}"));
        }

        let mut scaled = store.get(&created.key()).unwrap();
        scaled.as_stateful_set_mut().unwrap().spec.replicas = 1;
        let scaled = store.update(scaled).unwrap();

        // The highest ordinal is marked; nothing else moves until it is
        // fully gone.
        controller.reconcile(&scaled.key()).await.unwrap();
        let db2 = store.get(&ObjectKey::new(Kind::Pod, "default", "db-2")).unwrap();
        assert!(db2.meta.is_deleting());
        controller.reconcile(&scaled.key()).await.unwrap();
        let db1 = store.get(&ObjectKey::new(Kind::Pod, "default", "db-1")).unwrap();
        assert!(!db1.meta.is_deleting());

        // Termination completes; only then does the next ordinal retire.
        store.remove(&db2.key()).unwrap();
        controller.reconcile(&scaled.key()).await.unwrap();
        let db1 = store.get(&db1.key()).unwrap();
        assert!(db1.meta.is_deleting());

        // Claims survive scale-down.
        assert_eq!(
            store
                .list(Kind::PersistentVolumeClaim, Some("default"), None)
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn rolling_update_recreates_descending_and_keeps_claims() {
        let store = ObjectStore::new();
        let controller = StatefulSetController::new(store.clone());
        let created = store
            .create(stateful_set("db", 2, PvcRetentionPolicy::Retain))
            .unwrap();
        for ordinal in 0..2 {
            controller.reconcile(&created.key()).await.unwrap();
            mark_ready(&store, "default", &format!("db-{ordinal}"));
        }
        let claim_uid_before = store
            .get(&ObjectKey::new(Kind::PersistentVolumeClaim, "default", "data-db-1"))
            .unwrap()
            .meta
            .uid;

        let mut updated = store.get(&created.key()).unwrap();
        updated
            .as_stateful_set_mut()
            .unwrap()
            .spec
            .template
            .spec
            .image = "registry/db:v2".to_string();
        let updated = store.update(updated).unwrap();

        // The highest ordinal is recreated first.
        controller.reconcile(&updated.key()).await.unwrap();
        let db1_key = ObjectKey::new(Kind::Pod, "default", "db-1");
        assert!(store.get(&db1_key).unwrap().meta.is_deleting());
        let db0_key = ObjectKey::new(Kind::Pod, "default", "db-0");
        assert!(!store.get(&db0_key).unwrap().meta.is_deleting());

        // Finalize, recreate, and only then does ordinal 0 turn over.
        store.remove(&db1_key).unwrap();
        controller.reconcile(&updated.key()).await.unwrap();
        let db1 = store.get(&db1_key).unwrap();
        assert_eq!(db1.as_pod().unwrap().spec.image, "registry/db:v2");
        assert!(!store.get(&db0_key).unwrap().meta.is_deleting());

        mark_ready(&store, "default", "db-1");
        controller.reconcile(&updated.key()).await.unwrap();
        assert!(store.get(&db0_key).unwrap().meta.is_deleting());

        // The ordinal's claim rode through the recreation untouched.
        let claim = store
            .get(&ObjectKey::new(Kind::PersistentVolumeClaim, "default", "data-db-1"))
            .unwrap();
        assert_eq!(claim.meta.uid, claim_uid_before);
    }

    #[tokio::test]
    async fn retention_policy_is_recorded_on_claim_owner_reference() {
        let store = ObjectStore::new();
        let controller = StatefulSetController::new(store.clone());

        let retain = store
            .create(stateful_set("keep", 1, PvcRetentionPolicy::Retain))
            .unwrap();
        controller.reconcile(&retain.key()).await.unwrap();
        let claim = store
            .get(&ObjectKey::new(Kind::PersistentVolumeClaim, "default", "data-keep-0"))
            .unwrap();
        assert!(!claim.meta.owner_references[0].cascade);

        let delete = store
            .create(stateful_set("drop", 1, PvcRetentionPolicy::Delete))
            .unwrap();
        controller.reconcile(&delete.key()).await.unwrap();
        let claim = store
            .get(&ObjectKey::new(Kind::PersistentVolumeClaim, "default", "data-drop-0"))
            .unwrap();
        assert!(claim.meta.owner_references[0].cascade);
    }
}
