//! Deployment rollout reconciliation.
//!
//! A template change creates a fresh replica set at zero replicas; each
//! tick then applies one bounded step from the rollout engine, scaling the
//! new set up and the old sets down without breaching the surge or
//! unavailability bounds. Failure past the progress deadline is reported,
//! never auto-reverted; [`rollback`] is the distinct user-issued operation
//! that restores a previous revision's template.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tiller_api::{
    set_condition, Condition, DeploymentSpec, DeploymentStatus, Kind, Object, ObjectKey, Payload,
    ReplicaSetObject, ReplicaSetSpec, RolloutPhase,
};
use tiller_runtime::{ReconcileAction, ReconcileError, Reconciler, SpecHash};
use tiller_store::{ObjectStore, StoreError, WatchEvent, WatchFilter};
use tracing::info;

use super::{controller_ref, mark_degraded, owner_key, LABEL_TEMPLATE_HASH};
use crate::rollout::{is_complete, plan_step, RolloutShape};

const CONDITION_PROGRESSING: &str = "Progressing";

pub struct DeploymentController {
    store: ObjectStore,
}

impl DeploymentController {
    #[must_use]
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    fn write_status(&self, object: &Object, status: DeploymentStatus) -> Result<(), StoreError> {
        let Some(deploy) = object.as_deployment() else {
            return Ok(());
        };
        if status == deploy.status {
            return Ok(());
        }
        let mut updated = object.clone();
        if let Some(d) = updated.as_deployment_mut() {
            d.status = status;
        }
        self.store.update(updated)?;
        Ok(())
    }

    /// Removes retired replica sets beyond the history limit, oldest first.
    fn prune_history(&self, old_sets: &[&Object], limit: u32) -> Result<(), StoreError> {
        let retired: Vec<&&Object> = old_sets
            .iter()
            .filter(|s| s.as_replica_set().is_some_and(|rs| rs.spec.replicas == 0))
            .collect();
        let excess = retired.len().saturating_sub(limit as usize);
        for set in retired.iter().take(excess) {
            info!(replica_set = %set.key(), "pruning retired replica set");
            self.store.remove(&set.key())?;
        }
        Ok(())
    }
}

/// Stamps out the replica set for one template revision, at zero replicas.
fn build_replica_set(owner: &Object, spec: &DeploymentSpec, hash: &SpecHash) -> Object {
    let mut selector = spec.selector.clone();
    selector
        .match_labels
        .insert(LABEL_TEMPLATE_HASH.to_string(), hash.to_string());
    let mut template = spec.template.clone();
    template.labels.insert(LABEL_TEMPLATE_HASH, hash.as_str());

    let mut set = Object::new(
        &owner.meta.namespace,
        format!("{}-{}", owner.meta.name, hash),
        Payload::ReplicaSet(ReplicaSetObject {
            spec: ReplicaSetSpec {
                selector,
                template: template.clone(),
                replicas: 0,
            },
            status: Default::default(),
        }),
    );
    set.meta.labels = template.labels;
    set.meta.owner_references.push(controller_ref(owner, true));
    set
}

/// Restores the template of the most recently retired revision, making it
/// the "new" replica set again. Returns false when no previous revision
/// exists. The rollout engine never calls this on its own.
pub fn rollback(store: &ObjectStore, key: &ObjectKey) -> Result<bool, StoreError> {
    let object = store.get(key)?;
    let Some(deploy) = object.as_deployment() else {
        return Ok(false);
    };
    let hash = SpecHash::of(&deploy.spec.template);

    let sets = store.list(
        Kind::ReplicaSet,
        Some(&object.meta.namespace),
        Some(&deploy.spec.selector),
    );
    let mut candidates: Vec<&Object> = sets
        .iter()
        .filter(|s| s.meta.owned_by(object.meta.uid))
        .filter(|s| s.meta.labels.get(LABEL_TEMPLATE_HASH) != Some(hash.as_str()))
        .collect();
    candidates.sort_by(|a, b| {
        b.meta
            .creation_timestamp
            .cmp(&a.meta.creation_timestamp)
            .then_with(|| b.meta.name.cmp(&a.meta.name))
    });

    let Some(previous) = candidates.first().and_then(|s| s.as_replica_set()) else {
        return Ok(false);
    };
    let mut template = previous.spec.template.clone();
    template.labels.remove(LABEL_TEMPLATE_HASH);

    info!(deployment = %key, "rolling back to previous template");
    let mut updated = object.clone();
    if let Some(d) = updated.as_deployment_mut() {
        d.spec.template = template;
    }
    store.update(updated)?;
    Ok(true)
}

#[async_trait]
impl Reconciler for DeploymentController {
    fn name(&self) -> &'static str {
        "deployment"
    }

    fn watches(&self) -> Vec<WatchFilter> {
        vec![
            WatchFilter::kind(Kind::Deployment),
            WatchFilter::kind(Kind::ReplicaSet),
        ]
    }

    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match event.object.kind() {
            Kind::Deployment => vec![event.key()],
            Kind::ReplicaSet => owner_key(&event.object, Kind::Deployment)
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
        let Some(deploy) = object.as_deployment() else {
            return Ok(ReconcileAction::done());
        };
        if object.meta.is_deleting() {
            return Ok(ReconcileAction::done());
        }

        let spec = deploy.spec.clone();
        let hash = SpecHash::of(&spec.template);
        let now = Utc::now();

        if spec.paused {
            let mut status = deploy.status.clone();
            status.phase = RolloutPhase::Paused;
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_PROGRESSING, false, "Paused", "rollout is paused"),
            );
            self.write_status(&object, status)?;
            return Ok(ReconcileAction::done());
        }

        let sets = self.store.list(
            Kind::ReplicaSet,
            Some(&object.meta.namespace),
            Some(&spec.selector),
        );
        let owned: Vec<&Object> = sets
            .iter()
            .filter(|s| s.meta.owned_by(object.meta.uid) && !s.meta.is_deleting())
            .collect();

        let new_set = owned
            .iter()
            .copied()
            .find(|s| s.meta.labels.get(LABEL_TEMPLATE_HASH) == Some(hash.as_str()));
        let Some(new_set) = new_set else {
            let set = build_replica_set(&object, &spec, &hash);
            info!(deployment = %key, replica_set = %set.meta.name, "starting rollout");
            self.store.create(set)?;

            let mut status = deploy.status.clone();
            status.phase = RolloutPhase::Progressing;
            status.last_progress_time = Some(now);
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_PROGRESSING,
                    true,
                    "NewReplicaSetCreated",
                    "created replica set for updated template",
                ),
            );
            self.write_status(&object, status)?;
            return Ok(ReconcileAction::requeue_after(Duration::from_millis(50)));
        };

        // Count active and available pods per replica set. Intent counts
        // take the max of spec and observed pods, so surge room only opens
        // once a torn-down pod is actually terminating.
        let pods = self
            .store
            .list(Kind::Pod, Some(&object.meta.namespace), Some(&spec.selector));
        let count_for = |set: &Object| {
            let mut active = 0u32;
            let mut available = 0u32;
            for pod in &pods {
                if !pod.meta.owned_by(set.meta.uid) || pod.meta.is_deleting() {
                    continue;
                }
                let Some(p) = pod.as_pod() else { continue };
                if !p.is_active() {
                    continue;
                }
                active += 1;
                if p.is_available(spec.min_ready_seconds, now) {
                    available += 1;
                }
            }
            (active, available)
        };

        let (new_active, new_available) = count_for(new_set);
        let new_spec_replicas = new_set
            .as_replica_set()
            .map_or(0, |rs| rs.spec.replicas);

        let mut old_sets: Vec<&Object> = owned
            .iter()
            .copied()
            .filter(|s| s.meta.uid != new_set.meta.uid)
            .collect();
        old_sets.sort_by(|a, b| {
            a.meta
                .creation_timestamp
                .cmp(&b.meta.creation_timestamp)
                .then_with(|| a.meta.name.cmp(&b.meta.name))
        });

        let mut old_intent = 0u32;
        let mut old_available = 0u32;
        for set in &old_sets {
            let (active, available) = count_for(set);
            let replicas = set.as_replica_set().map_or(0, |rs| rs.spec.replicas);
            old_intent += replicas.max(active);
            old_available += available;
        }

        let shape = RolloutShape {
            desired: spec.replicas,
            new_intent: new_spec_replicas.max(new_active),
            old_intent,
            new_available,
            old_available,
        };
        let step = plan_step(&shape, &spec.strategy);
        let mut progressed = false;

        if step.scale_new_to != new_spec_replicas {
            info!(
                deployment = %key,
                from = new_spec_replicas,
                to = step.scale_new_to,
                "scaling new replica set"
            );
            let mut updated = (*new_set).clone();
            if let Some(rs) = updated.as_replica_set_mut() {
                rs.spec.replicas = step.scale_new_to;
            }
            self.store.update(updated)?;
            progressed = true;
        }

        let mut remaining = step.scale_old_down_by;
        for set in &old_sets {
            if remaining == 0 {
                break;
            }
            let replicas = set.as_replica_set().map_or(0, |rs| rs.spec.replicas);
            if replicas == 0 {
                continue;
            }
            let take = replicas.min(remaining);
            info!(
                deployment = %key,
                replica_set = %set.meta.name,
                from = replicas,
                to = replicas - take,
                "scaling down old replica set"
            );
            let mut updated = (*set).clone();
            if let Some(rs) = updated.as_replica_set_mut() {
                rs.spec.replicas = replicas - take;
            }
            self.store.update(updated)?;
            remaining -= take;
            progressed = true;
        }

        let complete = is_complete(&shape);
        let mut status = deploy.status.clone();
        status.updated_replicas = new_active;
        status.ready_replicas = new_available + old_available;
        if status.updated_replicas > deploy.status.updated_replicas
            || status.ready_replicas > deploy.status.ready_replicas
        {
            progressed = true;
        }

        if complete {
            status.phase = RolloutPhase::Complete;
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_PROGRESSING,
                    true,
                    "RolloutComplete",
                    "new replica set is fully available",
                ),
            );
            self.prune_history(&old_sets, spec.revision_history_limit)?;
        } else {
            if progressed || status.last_progress_time.is_none() {
                status.last_progress_time = Some(now);
            }
            let stalled = status.last_progress_time.is_some_and(|t| {
                now.signed_duration_since(t).num_seconds()
                    > i64::from(spec.progress_deadline_seconds)
            });
            if stalled {
                status.phase = RolloutPhase::Failed;
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_PROGRESSING,
                        false,
                        "ProgressDeadlineExceeded",
                        "rollout made no progress within the deadline",
                    ),
                );
            } else {
                status.phase = RolloutPhase::Progressing;
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_PROGRESSING,
                        true,
                        "RolloutProgressing",
                        "rollout is advancing within its bounds",
                    ),
                );
            }
        }
        self.write_status(&object, status)?;

        Ok(if complete {
            ReconcileAction::done()
        } else {
            ReconcileAction::requeue_after(Duration::from_secs(1))
        })
    }

    fn on_retries_exhausted(&self, key: &ObjectKey) {
        mark_degraded(&self.store, key, "rollout reconciliation kept failing");
    }
}
