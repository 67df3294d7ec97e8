//! Cluster snapshots for placement decisions.
//!
//! The scheduler never reads live shared state while deciding: it captures
//! an immutable snapshot of nodes and assigned pods per cycle and scores
//! against that. The node versions recorded here condition the binding
//! write, so a snapshot gone stale is detected at commit time.

use std::collections::BTreeMap;

use tiller_api::{Kind, LabelSelector, Labels, Object, PodPhase, ResourceSet, Taint};
use tiller_store::ObjectStore;

/// A pod already assigned to a node, reduced to what placement needs.
#[derive(Debug, Clone)]
pub struct PlacedPod {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    pub resources: ResourceSet,
}

/// One node with its current resource accounting.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub labels: Labels,
    pub taints: Vec<Taint>,
    pub allocatable: ResourceSet,

    /// Sum of resource requests of pods assigned to this node, including
    /// terminating pods, which hold their resources until fully gone.
    pub requested: ResourceSet,

    pub pods: Vec<PlacedPod>,

    /// Version the node was read at; binding is conditioned on it.
    pub resource_version: u64,
}

impl NodeInfo {
    /// Resources still free for new placements.
    #[must_use]
    pub fn free(&self) -> ResourceSet {
        self.allocatable.saturating_sub(&self.requested)
    }

    /// The topology domain value of this node for a label key.
    #[must_use]
    pub fn topology_value(&self, key: &str) -> Option<&str> {
        self.labels.get(key)
    }
}

/// An immutable cluster-wide view captured once per scheduling cycle.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    nodes: BTreeMap<String, NodeInfo>,
}

impl ClusterSnapshot {
    /// Captures all nodes and assigned pods from the store.
    #[must_use]
    pub fn capture(store: &ObjectStore) -> Self {
        let mut nodes: BTreeMap<String, NodeInfo> = store
            .list(Kind::Node, None, None)
            .into_iter()
            .filter_map(|object| {
                let node = object.as_node()?;
                Some((
                    object.meta.name.clone(),
                    NodeInfo {
                        name: object.meta.name.clone(),
                        labels: object.meta.labels.clone(),
                        taints: node.spec.taints.clone(),
                        allocatable: node.spec.allocatable,
                        requested: ResourceSet::ZERO,
                        pods: Vec::new(),
                        resource_version: object.meta.resource_version,
                    },
                ))
            })
            .collect();

        for object in store.list(Kind::Pod, None, None) {
            let Some(pod) = object.as_pod() else { continue };
            let Some(node_name) = pod.spec.node_name.as_deref() else {
                continue;
            };
            if matches!(pod.status.phase, PodPhase::Succeeded | PodPhase::Failed) {
                continue;
            }
            if let Some(info) = nodes.get_mut(node_name) {
                info.requested = info.requested.add(&pod.spec.resources);
                info.pods.push(placed(&object, pod.spec.resources));
            }
        }

        Self { nodes }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Counts pods matching `selector` across the topology domain that
    /// `candidate` belongs to for `topology_key`.
    ///
    /// Two nodes share a domain when both carry the topology label with
    /// equal values; a node always shares a domain with itself.
    #[must_use]
    pub fn matching_pods_in_domain(
        &self,
        candidate: &NodeInfo,
        selector: &LabelSelector,
        topology_key: &str,
    ) -> usize {
        let candidate_value = candidate.topology_value(topology_key);
        self.nodes()
            .filter(|node| {
                node.name == candidate.name
                    || matches!(
                        (candidate_value, node.topology_value(topology_key)),
                        (Some(a), Some(b)) if a == b
                    )
            })
            .flat_map(|node| node.pods.iter())
            .filter(|pod| selector.matches(&pod.labels))
            .count()
    }
}

fn placed(object: &Object, resources: ResourceSet) -> PlacedPod {
    PlacedPod {
        name: object.meta.name.clone(),
        namespace: object.meta.namespace.clone(),
        labels: object.meta.labels.clone(),
        resources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_api::{NodeObject, NodeSpec, Payload, PodObject, PodSpec};

    fn node(name: &str, zone: Option<&str>, cpu: u64) -> Object {
        let mut object = Object::cluster_scoped(
            name,
            Payload::Node(NodeObject {
                spec: NodeSpec {
                    allocatable: ResourceSet::new(cpu, 8 << 30),
                    taints: vec![],
                },
                status: Default::default(),
            }),
        );
        if let Some(zone) = zone {
            object.meta.labels.insert("zone", zone);
        }
        object
    }

    fn pod(name: &str, node: Option<&str>, cpu: u64, app: &str) -> Object {
        let mut object = Object::new(
            "default",
            name,
            Payload::Pod(PodObject {
                spec: PodSpec {
                    image: "registry/app:v1".to_string(),
                    resources: ResourceSet::new(cpu, 1 << 20),
                    node_name: node.map(str::to_string),
                    ..PodSpec::default()
                },
                status: Default::default(),
            }),
        );
        object.meta.labels.insert("app", app);
        object
    }

    #[test]
    fn capture_accounts_assigned_pods() {
        let store = ObjectStore::new();
        store.create(node("worker-1", Some("a"), 4000)).unwrap();
        store.create(node("worker-2", Some("b"), 4000)).unwrap();
        store.create(pod("web-1", Some("worker-1"), 500, "web")).unwrap();
        store.create(pod("web-2", Some("worker-1"), 250, "web")).unwrap();
        store.create(pod("idle", None, 9999, "web")).unwrap();

        let snapshot = ClusterSnapshot::capture(&store);
        let worker_1 = snapshot.node("worker-1").unwrap();
        assert_eq!(worker_1.requested.cpu_millis, 750);
        assert_eq!(worker_1.pods.len(), 2);
        assert_eq!(worker_1.free().cpu_millis, 3250);

        let worker_2 = snapshot.node("worker-2").unwrap();
        assert_eq!(worker_2.requested, ResourceSet::ZERO);
    }

    #[test]
    fn domain_matching_groups_by_label_value() {
        let store = ObjectStore::new();
        store.create(node("a1", Some("a"), 4000)).unwrap();
        store.create(node("a2", Some("a"), 4000)).unwrap();
        store.create(node("b1", Some("b"), 4000)).unwrap();
        store.create(node("plain", None, 4000)).unwrap();
        store.create(pod("web-1", Some("a1"), 100, "web")).unwrap();
        store.create(pod("db-1", Some("a2"), 100, "db")).unwrap();
        store.create(pod("web-2", Some("b1"), 100, "web")).unwrap();

        let snapshot = ClusterSnapshot::capture(&store);
        let selector = LabelSelector::from_labels([("app", "web")]);

        // Zone a sees web-1 from either of its nodes.
        let a2 = snapshot.node("a2").unwrap();
        assert_eq!(snapshot.matching_pods_in_domain(a2, &selector, "zone"), 1);

        // Zone b only sees its own pod.
        let b1 = snapshot.node("b1").unwrap();
        assert_eq!(snapshot.matching_pods_in_domain(b1, &selector, "zone"), 1);

        // A node without the topology label is its own domain.
        let plain = snapshot.node("plain").unwrap();
        assert_eq!(snapshot.matching_pods_in_domain(plain, &selector, "zone"), 0);
    }
}
