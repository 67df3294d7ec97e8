//! Placement properties with the full control loop running: capacity is
//! never exceeded, anti-affinity is never violated, and unschedulable
//! pods recover when the cluster grows.


use harness::*;
use tiller_api::{
    get_condition, Kind, LabelSelector, Object, ObjectKey, PodAffinityTerm, PodAntiAffinity,
    ResourceSet,
};
use tiller_store::ObjectStore;

fn bound_pods(store: &ObjectStore) -> Vec<Object> {
    active_pods(store)
        .into_iter()
        .filter(|p| p.as_pod().is_some_and(|pod| pod.spec.node_name.is_some()))
        .collect()
}

fn unschedulable_pods(store: &ObjectStore) -> Vec<Object> {
    active_pods(store)
        .into_iter()
        .filter(|p| {
            p.as_pod().is_some_and(|pod| {
                pod.spec.node_name.is_none()
                    && get_condition(&pod.status.conditions, "PodScheduled")
                        .is_some_and(|c| !c.status && c.reason == "Unschedulable")
            })
        })
        .collect()
}

/// Sum of bound pod requests per node never exceeds allocatable.
fn assert_no_node_overcommitted(store: &ObjectStore) {
    for node_object in store.list(Kind::Node, None, None) {
        let allocatable = node_object.as_node().unwrap().spec.allocatable;
        let mut requested = ResourceSet::ZERO;
        for pod in bound_pods(store) {
            let p = pod.as_pod().unwrap();
            if p.spec.node_name.as_deref() == Some(node_object.meta.name.as_str()) {
                requested = requested.add(&p.spec.resources);
            }
        }
        assert!(
            requested.fits_within(&allocatable),
            "node {} overcommitted: {:?} > {:?}",
            node_object.meta.name,
            requested,
            allocatable
        );
    }
}

#[tokio::test(start_paused = true)]
async fn capacity_gates_binding_until_nodes_arrive() {
    let cluster = Cluster::start();
    let store = cluster.store.clone();
    // One small node: room for a single 600m pod out of three.
    store.create(node("node-a", 1000, None)).unwrap();
    store.create(replica_set("web", 3, 600)).unwrap();

    wait_until("one pod bound, two parked unschedulable", || {
        bound_pods(&store).len() == 1 && unschedulable_pods(&store).len() == 2
    })
    .await;
    assert_no_node_overcommitted(&store);

    // Capacity arrives; the parked pods re-evaluate on the node event.
    store.create(node("node-b", 1300, None)).unwrap();
    wait_until("all pods bound", || {
        bound_pods(&store).len() == 3 && unschedulable_pods(&store).is_empty()
    })
    .await;
    assert_no_node_overcommitted(&store);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn required_anti_affinity_never_colocates_within_a_zone() {
    let cluster = Cluster::start();
    let store = cluster.store.clone();
    store.create(node("a1", 4000, Some("a"))).unwrap();
    store.create(node("a2", 4000, Some("a"))).unwrap();
    store.create(node("b1", 4000, Some("b"))).unwrap();

    let mut set = replica_set("web", 3, 100);
    {
        let rs = set.as_replica_set_mut().unwrap();
        rs.spec.template.spec.anti_affinity = Some(PodAntiAffinity {
            required: vec![PodAffinityTerm {
                selector: LabelSelector::from_labels([("app", "web")]),
                topology_key: "zone".to_string(),
            }],
            preferred: vec![],
        });
    }
    store.create(set).unwrap();

    // Two zones, three replicas: one pod must park.
    wait_until("two pods bound, one parked", || {
        bound_pods(&store).len() == 2 && unschedulable_pods(&store).len() == 1
    })
    .await;

    let zones: Vec<String> = bound_pods(&store)
        .iter()
        .map(|p| {
            let node_name = p.as_pod().unwrap().spec.node_name.clone().unwrap();
            let node = store
                .get(&ObjectKey::new(Kind::Node, "", node_name))
                .unwrap();
            node.meta.labels.get("zone").unwrap().to_string()
        })
        .collect();
    assert_ne!(zones[0], zones[1]);

    // A third zone opens up and the parked pod lands there.
    store.create(node("c1", 4000, Some("c"))).unwrap();
    wait_until("all pods bound across distinct zones", || {
        bound_pods(&store).len() == 3
    })
    .await;
    assert_no_node_overcommitted(&store);
    cluster.shutdown().await;
}
