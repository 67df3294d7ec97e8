//! The versioned object store.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tiller_api::{Kind, LabelSelector, Object, ObjectKey, Uid};
use tokio::sync::watch;
use tracing::debug;

use crate::error::StoreError;
use crate::watch::{EventType, WatchEvent, WatchFilter, WatchStream};

pub(crate) struct SharedState {
    pub(crate) state: RwLock<State>,
    head_tx: watch::Sender<u64>,
}

pub(crate) struct State {
    objects: BTreeMap<ObjectKey, Object>,
    /// Append-only change log. Grows for the lifetime of the store; log
    /// compaction is left to a future revision.
    log: Vec<WatchEvent>,
    next_version: u64,
}

impl State {
    /// Events with a sequence strictly greater than `cursor`.
    pub(crate) fn events_after(&self, cursor: u64) -> &[WatchEvent] {
        let start = self.log.partition_point(|e| e.sequence <= cursor);
        &self.log[start..]
    }
}

/// Strongly-consistent, versioned store of desired and observed state.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct ObjectStore {
    shared: Arc<SharedState>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    #[must_use]
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(SharedState {
                state: RwLock::new(State {
                    objects: BTreeMap::new(),
                    log: Vec::new(),
                    next_version: 1,
                }),
                head_tx,
            }),
        }
    }

    /// Submission entry point: create the object, or update it if it
    /// already exists (in which case the document must carry the version it
    /// was read at).
    ///
    /// Returns the assigned `resource_version`.
    pub fn submit(&self, object: Object) -> Result<u64, StoreError> {
        let key = object.key();
        let exists = {
            let state = self.read();
            state.objects.contains_key(&key)
        };
        let stored = if exists {
            self.update(object)?
        } else {
            self.create(object)?
        };
        Ok(stored.meta.resource_version)
    }

    /// Creates a new object, assigning its uid and first version.
    pub fn create(&self, mut object: Object) -> Result<Object, StoreError> {
        object.validate()?;
        let key = object.key();

        let mut state = self.write();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        object.meta.uid = Uid::new();
        object.meta.creation_timestamp = Utc::now();
        object.meta.deletion_timestamp = None;
        let version = Self::commit(&mut state, object.clone(), EventType::Added);
        object.meta.resource_version = version;

        drop(state);
        self.publish(version);
        debug!(key = %key, version, "object created");
        Ok(object)
    }

    /// Updates an existing object.
    ///
    /// The incoming document must carry the `resource_version` it was read
    /// at; a stale version fails with [`StoreError::Conflict`]. Identity
    /// fields (uid, creation timestamp, deletion timestamp) are preserved
    /// from the stored object.
    pub fn update(&self, object: Object) -> Result<Object, StoreError> {
        let mut state = self.write();
        let updated = Self::update_locked(&mut state, object)?;
        let version = updated.meta.resource_version;
        drop(state);
        self.publish(version);
        Ok(updated)
    }

    /// Update conditioned on *another* object's version being unchanged.
    ///
    /// Used by the scheduler: the pod binding is only committed if the
    /// chosen node still has the version observed in the scheduling
    /// snapshot. The write also advances the guard's version, so two
    /// decisions made against the same observation cannot both land.
    pub fn guarded_update(
        &self,
        guard: &ObjectKey,
        guard_version: u64,
        object: Object,
    ) -> Result<Object, StoreError> {
        let mut state = self.write();
        let current = state
            .objects
            .get(guard)
            .ok_or_else(|| StoreError::NotFound(guard.clone()))?;
        if current.meta.resource_version != guard_version {
            return Err(StoreError::Conflict {
                key: guard.clone(),
                expected: guard_version,
                actual: current.meta.resource_version,
            });
        }
        let guard_object = current.clone();
        let updated = Self::update_locked(&mut state, object)?;
        let version = Self::commit(&mut state, guard_object, EventType::Modified);
        drop(state);
        self.publish(version);
        Ok(updated)
    }

    /// Begins graceful deletion: stamps the deletion timestamp and emits a
    /// modification event. Idempotent; a second call is a no-op.
    pub fn mark_for_deletion(&self, key: &ObjectKey) -> Result<Object, StoreError> {
        let mut state = self.write();
        let stored = state
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if stored.meta.is_deleting() {
            return Ok(stored.clone());
        }

        let mut object = stored.clone();
        object.meta.deletion_timestamp = Some(Utc::now());
        let version = Self::commit(&mut state, object.clone(), EventType::Modified);
        object.meta.resource_version = version;

        drop(state);
        self.publish(version);
        debug!(key = %key, "object marked for deletion");
        Ok(object)
    }

    /// Removes an object and emits a deletion event carrying its last
    /// state.
    pub fn remove(&self, key: &ObjectKey) -> Result<Object, StoreError> {
        let mut state = self.write();
        let mut object = state
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let version = state.next_version;
        state.next_version += 1;
        object.meta.resource_version = version;
        state.log.push(WatchEvent {
            sequence: version,
            event_type: EventType::Deleted,
            object: object.clone(),
        });

        drop(state);
        self.publish(version);
        debug!(key = %key, "object removed");
        Ok(object)
    }

    /// Fetches a snapshot of one object.
    pub fn get(&self, key: &ObjectKey) -> Result<Object, StoreError> {
        let state = self.read();
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    /// Lists objects of a kind, optionally narrowed by namespace and label
    /// selector. Results are ordered by key for determinism.
    #[must_use]
    pub fn list(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Vec<Object> {
        let state = self.read();
        state
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .filter(|o| namespace.is_none_or(|ns| o.meta.namespace == ns))
            .filter(|o| selector.is_none_or(|s| s.matches(&o.meta.labels)))
            .cloned()
            .collect()
    }

    /// The highest version assigned so far.
    #[must_use]
    pub fn latest_version(&self) -> u64 {
        self.read().next_version - 1
    }

    /// Opens a watch subscription. With `resume_after`, replay starts just
    /// past that sequence; otherwise the full log is replayed.
    #[must_use]
    pub fn watch(&self, filter: WatchFilter, resume_after: Option<u64>) -> WatchStream {
        WatchStream::new(
            Arc::clone(&self.shared),
            filter,
            resume_after,
            self.shared.head_tx.subscribe(),
        )
    }

    fn update_locked(state: &mut State, mut object: Object) -> Result<Object, StoreError> {
        object.validate()?;
        let key = object.key();
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if object.meta.resource_version != stored.meta.resource_version {
            return Err(StoreError::Conflict {
                key,
                expected: object.meta.resource_version,
                actual: stored.meta.resource_version,
            });
        }

        object.meta.uid = stored.meta.uid;
        object.meta.creation_timestamp = stored.meta.creation_timestamp;
        // Deletion is one-way; an update can never resurrect.
        if stored.meta.deletion_timestamp.is_some() {
            object.meta.deletion_timestamp = stored.meta.deletion_timestamp;
        }

        let version = Self::commit(state, object.clone(), EventType::Modified);
        object.meta.resource_version = version;
        Ok(object)
    }

    /// Assigns the next version, stores the object, and appends the event.
    fn commit(state: &mut State, mut object: Object, event_type: EventType) -> u64 {
        let version = state.next_version;
        state.next_version += 1;
        object.meta.resource_version = version;
        state.log.push(WatchEvent {
            sequence: version,
            event_type,
            object: object.clone(),
        });
        state.objects.insert(object.key(), object);
        version
    }

    fn publish(&self, version: u64) {
        // send_replace never fails, even with no subscribers.
        self.shared.head_tx.send_replace(version);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.shared.state.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.shared.state.write().expect("store lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_api::{Labels, NodeObject, NodeSpec, Payload, PodObject, PodSpec, ResourceSet};

    fn pod(name: &str) -> Object {
        let mut object = Object::new(
            "default",
            name,
            Payload::Pod(PodObject {
                spec: PodSpec {
                    image: "registry/web:v1".to_string(),
                    ..PodSpec::default()
                },
                status: Default::default(),
            }),
        );
        object.meta.labels = Labels::from([("app", "web")]);
        object
    }

    fn node(name: &str) -> Object {
        Object::cluster_scoped(
            name,
            Payload::Node(NodeObject {
                spec: NodeSpec {
                    allocatable: ResourceSet::new(4000, 8 << 30),
                    taints: vec![],
                },
                status: Default::default(),
            }),
        )
    }

    #[test]
    fn submit_creates_then_updates() {
        let store = ObjectStore::new();
        let first = store.submit(pod("web-1")).unwrap();
        assert_eq!(first, 1);

        // Submitting the read-back document again lands as an update.
        let mut read = store.get(&pod("web-1").key()).unwrap();
        read.as_pod_mut().unwrap().status.ready = true;
        let second = store.submit(read).unwrap();
        assert!(second > first);

        let mut bad = pod("web-2");
        bad.as_pod_mut().unwrap().spec.image.clear();
        assert!(matches!(
            store.submit(bad).unwrap_err(),
            StoreError::Validation(_)
        ));
    }

    #[test]
    fn create_assigns_uid_and_version() {
        let store = ObjectStore::new();
        let created = store.create(pod("web-1")).unwrap();
        assert!(!created.meta.uid.is_nil());
        assert_eq!(created.meta.resource_version, 1);

        let err = store.create(pod("web-1")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn stale_update_conflicts() {
        let store = ObjectStore::new();
        let created = store.create(pod("web-1")).unwrap();

        let mut fresh = created.clone();
        fresh.as_pod_mut().unwrap().status.ready = true;
        let updated = store.update(fresh).unwrap();
        assert!(updated.meta.resource_version > created.meta.resource_version);

        // Writing through the original (now stale) copy fails.
        let mut stale = created;
        stale.as_pod_mut().unwrap().status.ready = false;
        let err = store.update(stale).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn update_preserves_identity() {
        let store = ObjectStore::new();
        let created = store.create(pod("web-1")).unwrap();
        let uid = created.meta.uid;

        let mut changed = created;
        changed.meta.uid = Uid::new();
        let updated = store.update(changed).unwrap();
        assert_eq!(updated.meta.uid, uid);
    }

    #[test]
    fn validation_rejected_at_submission() {
        let store = ObjectStore::new();
        let mut bad = pod("web-1");
        bad.as_pod_mut().unwrap().spec.image.clear();
        let err = store.create(bad).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.latest_version(), 0);
    }

    #[test]
    fn mark_for_deletion_is_idempotent() {
        let store = ObjectStore::new();
        store.create(pod("web-1")).unwrap();
        let key = pod("web-1").key();

        let marked = store.mark_for_deletion(&key).unwrap();
        assert!(marked.meta.is_deleting());
        let version = marked.meta.resource_version;

        let again = store.mark_for_deletion(&key).unwrap();
        assert_eq!(again.meta.resource_version, version);
        assert_eq!(
            again.meta.deletion_timestamp,
            marked.meta.deletion_timestamp
        );
    }

    #[test]
    fn update_cannot_resurrect() {
        let store = ObjectStore::new();
        let created = store.create(pod("web-1")).unwrap();
        let marked = store.mark_for_deletion(&created.key()).unwrap();

        let mut resurrect = marked.clone();
        resurrect.meta.deletion_timestamp = None;
        let updated = store.update(resurrect).unwrap();
        assert!(updated.meta.is_deleting());
    }

    #[test]
    fn guarded_update_checks_guard_version() {
        let store = ObjectStore::new();
        let node = store.create(node("worker-1")).unwrap();
        let pod = store.create(pod("web-1")).unwrap();

        let mut bound = pod.clone();
        bound.as_pod_mut().unwrap().spec.node_name = Some("worker-1".to_string());

        // Guard version moved: binding must fail and not be applied.
        let mut node_change = node.clone();
        node_change.as_node_mut().unwrap().spec.allocatable = ResourceSet::new(2000, 4 << 30);
        store.update(node_change).unwrap();

        let err = store
            .guarded_update(&node.key(), node.meta.resource_version, bound.clone())
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store
            .get(&pod.key())
            .unwrap()
            .as_pod()
            .unwrap()
            .spec
            .node_name
            .is_none());

        // With the fresh guard version it goes through.
        let fresh_node = store.get(&node.key()).unwrap();
        store
            .guarded_update(&node.key(), fresh_node.meta.resource_version, bound)
            .unwrap();

        // The successful write advanced the guard version.
        let touched = store.get(&node.key()).unwrap();
        assert!(touched.meta.resource_version > fresh_node.meta.resource_version);
    }

    #[test]
    fn guarded_updates_against_one_observation_cannot_both_land() {
        let store = ObjectStore::new();
        let node = store.create(node("worker-1")).unwrap();
        let first = store.create(pod("web-1")).unwrap();
        let second = store.create(pod("web-2")).unwrap();
        let observed = node.meta.resource_version;

        let mut bind_first = first;
        bind_first.as_pod_mut().unwrap().spec.node_name = Some("worker-1".to_string());
        store.guarded_update(&node.key(), observed, bind_first).unwrap();

        // The second decision was made against the same observation; it
        // must conflict rather than silently stack onto the node.
        let mut bind_second = second.clone();
        bind_second.as_pod_mut().unwrap().spec.node_name = Some("worker-1".to_string());
        let err = store
            .guarded_update(&node.key(), observed, bind_second)
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store
            .get(&second.key())
            .unwrap()
            .as_pod()
            .unwrap()
            .spec
            .node_name
            .is_none());
    }

    #[test]
    fn list_filters_by_namespace_and_selector() {
        let store = ObjectStore::new();
        store.create(pod("web-1")).unwrap();
        let mut other = pod("db-1");
        other.meta.labels = Labels::from([("app", "db")]);
        store.create(other).unwrap();
        let mut elsewhere = pod("web-2");
        elsewhere.meta.namespace = "staging".to_string();
        store.create(elsewhere).unwrap();

        assert_eq!(store.list(Kind::Pod, None, None).len(), 3);
        assert_eq!(store.list(Kind::Pod, Some("default"), None).len(), 2);

        let selector = tiller_api::LabelSelector::from_labels([("app", "web")]);
        let web = store.list(Kind::Pod, Some("default"), Some(&selector));
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].meta.name, "web-1");
    }

    #[tokio::test]
    async fn watch_replays_and_resumes() {
        let store = ObjectStore::new();
        store.create(pod("web-1")).unwrap();
        store.create(node("worker-1")).unwrap();
        let created = store.create(pod("web-2")).unwrap();

        let mut stream = store.watch(WatchFilter::kind(Kind::Pod), None);
        let first = stream.next().await;
        assert_eq!(first.event_type, EventType::Added);
        assert_eq!(first.object.meta.name, "web-1");

        let second = stream.next().await;
        assert_eq!(second.object.meta.name, "web-2");
        let token = stream.resume_token();

        // A restarted subscription with the token sees only what follows.
        store.remove(&created.key()).unwrap();
        let mut resumed = store.watch(WatchFilter::kind(Kind::Pod), Some(token));
        let third = resumed.next().await;
        assert_eq!(third.event_type, EventType::Deleted);
        assert_eq!(third.object.meta.name, "web-2");
        assert!(resumed.try_next().is_none());
    }

    #[tokio::test]
    async fn watch_is_ordered_per_key() {
        let store = ObjectStore::new();
        let created = store.create(pod("web-1")).unwrap();
        let mut changed = created.clone();
        changed.as_pod_mut().unwrap().status.ready = true;
        store.update(changed).unwrap();
        store.mark_for_deletion(&created.key()).unwrap();
        store.remove(&created.key()).unwrap();

        let mut stream = store.watch(WatchFilter::kind(Kind::Pod), None);
        let mut sequences = Vec::new();
        for _ in 0..4 {
            sequences.push(stream.next().await.sequence);
        }
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);
    }

    #[tokio::test]
    async fn watch_selector_narrows_events() {
        let store = ObjectStore::new();
        store.create(pod("web-1")).unwrap();
        let mut db = pod("db-1");
        db.meta.labels = Labels::from([("app", "db")]);
        store.create(db).unwrap();

        let selector = tiller_api::LabelSelector::from_labels([("app", "db")]);
        let mut stream = store.watch(WatchFilter::kind(Kind::Pod).with_selector(selector), None);
        let event = stream.next().await;
        assert_eq!(event.object.meta.name, "db-1");
        assert!(stream.try_next().is_none());
    }
}
