//! End-to-end deployment rollout: store, scheduler, controllers, and the
//! simulated runtime all running together.


use std::collections::HashSet;
use std::time::Duration;

use harness::*;
use tiller_api::{Kind, ObjectKey, RolloutPhase};
use tiller_control_plane::controllers::rollback;

#[tokio::test(start_paused = true)]
async fn rollout_holds_surge_and_availability_bounds() {
    let cluster = Cluster::start();
    let store = cluster.store.clone();
    for index in 0..3 {
        store
            .create(node(&format!("node-{index}"), 4000, Some("a")))
            .unwrap();
    }
    store
        .create(deployment("web", 3, 1, 0, "registry/web:v1"))
        .unwrap();

    wait_until("initial rollout to complete", || {
        deployment_phase(&store, "web") == RolloutPhase::Complete
            && ready_count(&active_pods(&store)) == 3
    })
    .await;

    let old_names: HashSet<String> = active_pods(&store)
        .into_iter()
        .map(|p| p.meta.name)
        .collect();

    // Pin the v1 pods ready and leave every new pod unready, so the
    // rollout parks deterministically at its first step.
    cluster.probes.set_default(false);
    for name in &old_names {
        cluster
            .probes
            .set_ready(ObjectKey::new(Kind::Pod, "default", name.clone()), true);
    }

    let key = ObjectKey::new(Kind::Deployment, "default", "web");
    let mut updated = store.get(&key).unwrap();
    updated.as_deployment_mut().unwrap().spec.template.spec.image =
        "registry/web:v2".to_string();
    store.update(updated).unwrap();

    // With replicas=3, surge=1, unavailable=0 the held state is exactly
    // four pods: three old and ready, one new and not yet ready.
    wait_until("the surge pod to appear", || {
        let pods = active_pods(&store);
        pods.len() == 4 && ready_count(&pods) == 3
    })
    .await;

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pods = active_pods(&store);
        assert!(pods.len() <= 4, "surge bound breached: {} pods", pods.len());
        assert!(
            ready_count(&pods) >= 3,
            "availability floor breached: {} ready",
            ready_count(&pods)
        );
    }
    assert_eq!(deployment_phase(&store, "web"), RolloutPhase::Progressing);
    let new_pods: Vec<String> = active_pods(&store)
        .into_iter()
        .filter(|p| !old_names.contains(&p.meta.name))
        .map(|p| p.meta.name)
        .collect();
    assert_eq!(new_pods.len(), 1);
    assert!(!old_names.contains(&new_pods[0]));

    // Let probes pass again: the rollout walks to completion while the
    // bounds keep holding.
    cluster.probes.set_default(true);
    for name in &old_names {
        cluster
            .probes
            .clear(&ObjectKey::new(Kind::Pod, "default", name.clone()));
    }
    wait_until("the rollout to complete on v2", || {
        let pods = active_pods(&store);
        assert!(pods.len() <= 4, "surge bound breached: {} pods", pods.len());
        deployment_phase(&store, "web") == RolloutPhase::Complete
            && pods.len() == 3
            && pods
                .iter()
                .all(|p| p.as_pod().unwrap().spec.image == "registry/web:v2")
    })
    .await;

    let final_pods = active_pods(&store);
    assert_eq!(ready_count(&final_pods), 3);
    assert!(final_pods.iter().all(|p| !old_names.contains(&p.meta.name)));
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rollback_walks_back_to_the_previous_revision() {
    let cluster = Cluster::start();
    let store = cluster.store.clone();
    store.create(node("node-0", 4000, None)).unwrap();
    store
        .create(deployment("web", 2, 1, 0, "registry/web:v1"))
        .unwrap();

    wait_until("v1 rollout to complete", || {
        deployment_phase(&store, "web") == RolloutPhase::Complete
            && ready_count(&active_pods(&store)) == 2
    })
    .await;

    let key = ObjectKey::new(Kind::Deployment, "default", "web");
    let mut updated = store.get(&key).unwrap();
    updated.as_deployment_mut().unwrap().spec.template.spec.image =
        "registry/web:v2".to_string();
    store.update(updated).unwrap();

    wait_until("v2 rollout to complete", || {
        let pods = active_pods(&store);
        deployment_phase(&store, "web") == RolloutPhase::Complete
            && pods.len() == 2
            && pods
                .iter()
                .all(|p| p.as_pod().unwrap().spec.image == "registry/web:v2")
    })
    .await;

    // The retired v1 replica set is retained at zero for exactly this.
    assert!(rollback(&store, &key).unwrap());

    wait_until("rollback to converge on v1", || {
        let pods = active_pods(&store);
        deployment_phase(&store, "web") == RolloutPhase::Complete
            && pods.len() == 2
            && pods
                .iter()
                .all(|p| p.as_pod().unwrap().spec.image == "registry/web:v1")
    })
    .await;
    cluster.shutdown().await;
}
