#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::cluster::mock::PodStartup;
use crate::controller::health_check::MockHealthProbe;
use crate::controller::replicaset::build_replica_set;
use crate::controller::strategies::testing::{descriptor, Harness};
use std::time::Duration;

/// Desired replica counts the named replica-set went through, in order
async fn scale_history(mut events: EventStream<ReplicaSet>, name: &str) -> Vec<i32> {
    let mut counts = Vec::new();
    while let Ok(Some(Ok(event))) =
        tokio::time::timeout(Duration::from_millis(100), events.next()).await
    {
        if let WatchedEvent::Modified(rs) = event {
            if rs.metadata.name.as_deref() == Some(name) {
                counts.push(desired_replicas(&rs));
            }
        }
    }
    counts
}

#[tokio::test]
async fn test_old_set_shrinks_one_per_healthy_pod() {
    let h = Harness::new(MockHealthProbe::healthy());
    h.seed_version(&descriptor(3), "1").await;
    let events = h
        .cluster
        .watch_replica_sets("prod", &app_selector("shop"), "0")
        .await
        .unwrap();

    RollingStrategy
        .deploy(&h.context(descriptor(3), "2"))
        .await
        .unwrap();

    let history = scale_history(events, "shop-1").await;
    assert_eq!(&history[..3], &[2, 1, 0]);
    assert!(history[3..].iter().all(|c| *c == 0));
    assert_eq!(h.cluster.replica_set_names("prod"), vec!["shop-2"]);
    assert_eq!(h.cluster.pods("prod").len(), 3);
}

#[tokio::test]
async fn test_unhealthy_pod_stops_scale_down() {
    let h = Harness::new(MockHealthProbe::healthy_for(1));
    h.seed_version(&descriptor(3), "1").await;

    let err = RollingStrategy
        .deploy(&h.context(descriptor(3), "2"))
        .await
        .unwrap_err();

    assert!(!err.is_timeout());
    assert_eq!(
        h.lifecycle.current_replicas("prod", "shop-1").await.unwrap(),
        2
    );
    assert!(h.progress.contains("failed its health check"));
    assert!(h.progress.contains("stopped with shop-1 left at 2 replicas"));
}

#[tokio::test]
async fn test_both_versions_serve_during_rollout() {
    let h = Harness::new(MockHealthProbe::healthy());
    h.seed_version(&descriptor(1), "1").await;
    h.cluster.set_pod_startup(PodStartup::Pending);

    let ctx = h.context(descriptor(1), "2");
    let rollout = tokio::spawn(async move { RollingStrategy.deploy(&ctx).await });

    // New pods stay Pending, freezing the overlap
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.backend_servers("prod-shop-2").await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("new endpoints registered");
    assert_eq!(h.backend_servers("prod-shop-1").await, 1);

    h.cluster.start_pending_pods("prod");
    rollout.await.unwrap().unwrap();

    assert_eq!(h.routed_backend().await.as_deref(), Some("prod-shop-2"));
    assert_eq!(h.backend_servers("prod-shop-1").await, 0);
}

#[tokio::test]
async fn test_failed_rollout_withdraws_new_endpoints_from_old_backend() {
    let h = Harness::new(MockHealthProbe::healthy_for(1));
    h.seed_version(&descriptor(2), "1").await;

    RollingStrategy
        .deploy(&h.context(descriptor(2), "2"))
        .await
        .unwrap_err();

    // Seeding registers nothing, so the old backend is empty again
    assert_eq!(h.backend_servers("prod-shop-1").await, 0);
    assert_eq!(h.backend_servers("prod-shop-2").await, 1);
    assert!(h.progress.contains("from backend prod-shop-1"));
}

#[tokio::test]
async fn test_rollout_survives_compacted_replica_set_history() {
    let h = Harness::new(MockHealthProbe::healthy());
    h.seed_version(&descriptor(2), "1").await;
    // Old set's own resource version now predates the watch window
    h.cluster.compact_replica_set_events();

    RollingStrategy
        .deploy(&h.context(descriptor(2), "2"))
        .await
        .unwrap();

    assert_eq!(h.cluster.replica_set_names("prod"), vec!["shop-2"]);
    assert_eq!(h.routed_backend().await.as_deref(), Some("prod-shop-2"));
}

#[tokio::test]
async fn test_expired_watch_is_reopened_from_a_fresh_list() {
    let h = Harness::new(MockHealthProbe::healthy());
    h.seed_version(&descriptor(3), "1").await;
    h.cluster.expire_next_replica_set_watch();

    RollingStrategy
        .deploy(&h.context(descriptor(3), "2"))
        .await
        .unwrap();

    assert_eq!(h.cluster.replica_set_names("prod"), vec!["shop-2"]);
    assert_eq!(h.cluster.pods("prod").len(), 3);
}

#[tokio::test]
async fn test_unlabelled_old_set_is_rejected_before_any_change() {
    let h = Harness::new(MockHealthProbe::healthy());
    let mut unlabelled = build_replica_set(&descriptor(1), "1");
    if let Some(labels) = unlabelled.metadata.labels.as_mut() {
        labels.remove(LABEL_VERSION);
    }
    h.cluster.insert_replica_set("prod", unlabelled);

    let err = RollingStrategy
        .deploy(&h.context(descriptor(1), "2"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StrategyError::Lifecycle(LifecycleError::InvalidVersionLabel { ref name, .. })
            if name == "shop-1"
    ));
    assert_eq!(h.cluster.replica_set_names("prod"), vec!["shop-1"]);
    assert!(h.cluster.service_names("prod").is_empty());
    assert_eq!(h.routed_backend().await, None);
}

#[tokio::test]
async fn test_completed_rollout_switches_frontend() {
    let h = Harness::new(MockHealthProbe::healthy());
    RollingStrategy
        .deploy(&h.context(descriptor(2), "1"))
        .await
        .unwrap();
    assert_eq!(h.routed_backend().await.as_deref(), Some("prod-shop-1"));

    RollingStrategy
        .deploy(&h.context(descriptor(2), "2"))
        .await
        .unwrap();

    assert_eq!(h.routed_backend().await.as_deref(), Some("prod-shop-2"));
    assert_eq!(h.backend_servers("prod-shop-1").await, 0);
}

#[tokio::test]
async fn test_fewer_new_replicas_still_empties_old_set() {
    let h = Harness::new(MockHealthProbe::healthy());
    h.seed_version(&descriptor(3), "1").await;

    RollingStrategy
        .deploy(&h.context(descriptor(1), "2"))
        .await
        .unwrap();

    assert_eq!(h.cluster.replica_set_names("prod"), vec!["shop-2"]);
    assert_eq!(h.cluster.pods("prod").len(), 1);
}
