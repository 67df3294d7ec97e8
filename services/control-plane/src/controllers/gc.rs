//! Owner-reference garbage collection.
//!
//! Ownership is a tree of parent pointers with explicit cascade flags.
//! When an owner disappears, children whose references carry cascade are
//! deleted; references without cascade deliberately orphan the child
//! (retained claims, for example). A uid mismatch counts as a missing
//! owner, so a recreated object never adopts its predecessor's children.
//! The periodic resync doubles as the orphan sweep.

use async_trait::async_trait;
use tiller_api::{Kind, ObjectKey};
use tiller_runtime::{ReconcileAction, ReconcileError, Reconciler};
use tiller_store::{EventType, ObjectStore, StoreError, WatchEvent, WatchFilter};
use tracing::info;

pub struct GcController {
    store: ObjectStore,
}

impl GcController {
    #[must_use]
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Reconciler for GcController {
    fn name(&self) -> &'static str {
        "gc"
    }

    fn watches(&self) -> Vec<WatchFilter> {
        vec![WatchFilter::everything()]
    }

    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match event.event_type {
            // The deleted object's children are the work.
            EventType::Deleted => {
                let uid = event.object.meta.uid;
                let mut keys = Vec::new();
                for kind in Kind::ALL {
                    for object in self.store.list(kind, None, None) {
                        if object.meta.owned_by(uid) {
                            keys.push(object.key());
                        }
                    }
                }
                keys
            }
            // A cheap liveness check; catches children created against an
            // owner that vanished first.
            _ => vec![event.key()],
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let object = match self.store.get(key) {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => return Ok(ReconcileAction::done()),
            Err(err) => return Err(err.into()),
        };
        if object.meta.is_deleting() {
            return Ok(ReconcileAction::done());
        }

        for reference in &object.meta.owner_references {
            if !reference.cascade {
                continue;
            }
            let owner_namespace = if reference.kind.is_cluster_scoped() {
                String::new()
            } else {
                object.meta.namespace.clone()
            };
            let owner_key =
                ObjectKey::new(reference.kind, owner_namespace, reference.name.clone());
            let alive = match self.store.get(&owner_key) {
                Ok(owner) => owner.meta.uid == reference.uid,
                Err(StoreError::NotFound(_)) => false,
                Err(err) => return Err(err.into()),
            };
            if alive {
                continue;
            }

            info!(child = %key, owner = %owner_key, "collecting orphaned child");
            match key.kind {
                // Pods terminate gracefully; everything else goes at once.
                Kind::Pod => {
                    self.store.mark_for_deletion(key)?;
                }
                _ => {
                    self.store.remove(key)?;
                }
            }
            return Ok(ReconcileAction::done());
        }

        Ok(ReconcileAction::done())
    }
}
