//! Volume binding reconciliation.
//!
//! Pending claims bind to the smallest available volume that satisfies
//! them (matching class, superset access modes, sufficient capacity); when
//! none exists the external provisioner is asked for one. The binding is
//! a cross-reference between the two objects, never an ownership edge,
//! and is irreversible while the claim exists. Claim deletion moves the
//! volume to `Released` under the retain policy; its data outlives the
//! claim.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiller_api::{
    set_condition, ClaimRef, Condition, Kind, Object, ObjectKey, Payload, PvObject, PvPhase,
    PvcPhase,
};
use tiller_runtime::{ReconcileAction, ReconcileError, Reconciler};
use tiller_store::{EventType, ObjectStore, StoreError, WatchEvent, WatchFilter};
use tracing::{debug, info};

use super::mark_degraded;
use crate::external::{ProvisionOutcome, VolumeProvisioner};

const CONDITION_PROVISIONED: &str = "Provisioned";

/// Bound on one provisioner round trip.
const PROVISION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct VolumeBinderController {
    store: ObjectStore,
    provisioner: Arc<dyn VolumeProvisioner>,
}

impl VolumeBinderController {
    #[must_use]
    pub fn new(store: ObjectStore, provisioner: Arc<dyn VolumeProvisioner>) -> Self {
        Self { store, provisioner }
    }

    fn pending_claim_keys(&self) -> Vec<ObjectKey> {
        self.store
            .list(Kind::PersistentVolumeClaim, None, None)
            .into_iter()
            .filter(|o| {
                !o.meta.is_deleting()
                    && o.as_pvc().is_some_and(|c| c.status.phase == PvcPhase::Pending)
            })
            .map(|o| o.key())
            .collect()
    }

    async fn reconcile_claim(&self, object: Object) -> Result<ReconcileAction, ReconcileError> {
        let Some(claim) = object.as_pvc() else {
            return Ok(ReconcileAction::done());
        };
        if object.meta.is_deleting() || claim.status.phase == PvcPhase::Bound {
            return Ok(ReconcileAction::done());
        }

        let volumes = self.store.list(Kind::PersistentVolume, None, None);

        // A volume may already reference this claim if a previous pass
        // died between the two binding writes; finish the claim side.
        let half_bound = volumes.iter().find(|v| {
            v.as_pv().is_some_and(|pv| {
                pv.status
                    .claim_ref
                    .as_ref()
                    .is_some_and(|r| r.uid == object.meta.uid)
            })
        });
        if let Some(volume) = half_bound {
            return self.complete_claim(&object, &volume.meta.name);
        }

        let mut candidates: Vec<&Object> = volumes
            .iter()
            .filter(|v| v.as_pv().is_some_and(|pv| pv.satisfies(&claim.spec)))
            .collect();
        candidates.sort_by_key(|v| {
            (
                v.as_pv().map_or(u64::MAX, |pv| pv.spec.capacity_bytes),
                v.meta.name.clone(),
            )
        });

        if let Some(volume) = candidates.first() {
            info!(claim = %object.key(), volume = %volume.meta.name, "binding claim");
            let mut bound = (*volume).clone();
            if let Some(pv) = bound.as_pv_mut() {
                pv.status.phase = PvPhase::Bound;
                pv.status.claim_ref = Some(ClaimRef {
                    namespace: object.meta.namespace.clone(),
                    name: object.meta.name.clone(),
                    uid: object.meta.uid,
                });
            }
            self.store.update(bound)?;
            return self.complete_claim(&object, &volume.meta.name);
        }

        // Nothing matches: ask the provisioner.
        match tokio::time::timeout(PROVISION_TIMEOUT, self.provisioner.provision(&object))
            .await
            .map_err(|_| ReconcileError::Transient("provisioner timed out".to_string()))?
            .map_err(|err| ReconcileError::Transient(err.to_string()))?
        {
            ProvisionOutcome::Provisioned { name, spec } => {
                info!(claim = %object.key(), volume = %name, "volume provisioned");
                self.store.create(Object::cluster_scoped(
                    name,
                    Payload::PersistentVolume(PvObject {
                        spec,
                        status: Default::default(),
                    }),
                ))?;
                // Bind on the next pass against the fresh volume list.
                Ok(ReconcileAction::requeue_after(Duration::from_millis(50)))
            }
            ProvisionOutcome::Pending => {
                let mut updated = object.clone();
                if let Some(c) = updated.as_pvc_mut() {
                    set_condition(
                        &mut c.status.conditions,
                        Condition::new(
                            CONDITION_PROVISIONED,
                            false,
                            "WaitingForProvisioner",
                            "no available volume satisfies the claim",
                        ),
                    );
                }
                if updated != object {
                    self.store.update(updated)?;
                }
                Ok(ReconcileAction::requeue_after(Duration::from_secs(5)))
            }
        }
    }

    fn complete_claim(
        &self,
        object: &Object,
        volume_name: &str,
    ) -> Result<ReconcileAction, ReconcileError> {
        let mut updated = object.clone();
        if let Some(c) = updated.as_pvc_mut() {
            c.status.phase = PvcPhase::Bound;
            c.status.volume_name = Some(volume_name.to_string());
            set_condition(
                &mut c.status.conditions,
                Condition::new(
                    CONDITION_PROVISIONED,
                    true,
                    "Bound",
                    format!("bound to volume {volume_name}"),
                ),
            );
        }
        self.store.update(updated)?;
        Ok(ReconcileAction::done())
    }

    /// Volume-side pass: a bound volume whose claim is gone parks in
    /// `Released`, keeping its claim reference for provenance.
    fn reconcile_volume(&self, object: Object) -> Result<ReconcileAction, ReconcileError> {
        let Some(pv) = object.as_pv() else {
            return Ok(ReconcileAction::done());
        };
        if pv.status.phase != PvPhase::Bound {
            return Ok(ReconcileAction::done());
        }
        let Some(claim_ref) = &pv.status.claim_ref else {
            return Ok(ReconcileAction::done());
        };

        let claim_key = ObjectKey::new(
            Kind::PersistentVolumeClaim,
            claim_ref.namespace.clone(),
            claim_ref.name.clone(),
        );
        let claim_alive = match self.store.get(&claim_key) {
            Ok(claim) => claim.meta.uid == claim_ref.uid,
            Err(StoreError::NotFound(_)) => false,
            Err(err) => return Err(err.into()),
        };
        if claim_alive {
            return Ok(ReconcileAction::done());
        }

        info!(volume = %object.key(), "claim gone, releasing volume");
        let mut released = object.clone();
        if let Some(pv) = released.as_pv_mut() {
            pv.status.phase = PvPhase::Released;
        }
        self.store.update(released)?;
        Ok(ReconcileAction::done())
    }
}

#[async_trait]
impl Reconciler for VolumeBinderController {
    fn name(&self) -> &'static str {
        "volumebinder"
    }

    fn watches(&self) -> Vec<WatchFilter> {
        vec![
            WatchFilter::kind(Kind::PersistentVolumeClaim),
            WatchFilter::kind(Kind::PersistentVolume),
        ]
    }

    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match event.object.kind() {
            Kind::PersistentVolumeClaim => {
                let mut keys = vec![event.key()];
                // A deleted claim's volume needs the release pass.
                if event.event_type == EventType::Deleted {
                    if let Some(volume) = event
                        .object
                        .as_pvc()
                        .and_then(|c| c.status.volume_name.as_deref())
                    {
                        keys.push(ObjectKey::new(Kind::PersistentVolume, "", volume));
                    }
                }
                keys
            }
            // A new or freed volume may satisfy a waiting claim.
            Kind::PersistentVolume => {
                let mut keys = self.pending_claim_keys();
                keys.push(event.key());
                keys
            }
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let object = match self.store.get(key) {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => return Ok(ReconcileAction::done()),
            Err(err) => return Err(err.into()),
        };
        match key.kind {
            Kind::PersistentVolumeClaim => self.reconcile_claim(object).await,
            Kind::PersistentVolume => self.reconcile_volume(object),
            _ => {
                debug!(key = %key, "ignoring foreign key");
                Ok(ReconcileAction::done())
            }
        }
    }

    fn on_retries_exhausted(&self, key: &ObjectKey) {
        mark_degraded(&self.store, key, "volume binding kept failing");
    }
}
