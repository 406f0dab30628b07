//! Registry integration tests against a live Redis.
//!
//! Skipped unless `ZAGARA_TEST_REDIS_URL` is set.

mod common;

use std::sync::Arc;
use std::time::Duration;

use zagara::domain::errors::SwarmError;
use zagara::domain::models::{SwarmFilter, SwarmPriority, SwarmRecord, SwarmStatus};
use zagara::services::SwarmRegistry;

macro_rules! require_redis {
    () => {
        match common::test_redis().await {
            Some(redis) => redis,
            None => {
                eprintln!("skipping: set ZAGARA_TEST_REDIS_URL to run");
                return;
            }
        }
    };
}

#[tokio::test]
async fn register_is_atomic_and_unique() {
    let redis = require_redis!();
    let registry = SwarmRegistry::new(redis, common::test_keys("registry-unique"));

    let record = SwarmRecord::new("swarm-a");
    registry.register(&record).await.unwrap();

    let duplicate = SwarmRecord::new("swarm-a");
    match registry.register(&duplicate).await {
        Err(SwarmError::AlreadyExists(id)) => assert_eq!(id, "swarm-a"),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    let fetched = registry.get_swarm("swarm-a").await.unwrap();
    assert_eq!(fetched.swarm_id, "swarm-a");
    assert_eq!(fetched.status, SwarmStatus::Initializing);
}

#[tokio::test]
async fn lifecycle_transitions_are_enforced() {
    let redis = require_redis!();
    let registry = SwarmRegistry::new(redis, common::test_keys("registry-lifecycle"));

    registry.register(&SwarmRecord::new("swarm-a")).await.unwrap();
    registry
        .update_status("swarm-a", SwarmStatus::Active)
        .await
        .unwrap();
    registry
        .update_status("swarm-a", SwarmStatus::Paused)
        .await
        .unwrap();
    registry
        .update_status("swarm-a", SwarmStatus::Active)
        .await
        .unwrap();

    // active -> terminated is not an edge of the lifecycle
    match registry
        .update_status("swarm-a", SwarmStatus::Terminated)
        .await
    {
        Err(SwarmError::IllegalTransition { from, to }) => {
            assert_eq!(from, "active");
            assert_eq!(to, "terminated");
        }
        other => panic!("expected IllegalTransition, got {other:?}"),
    }

    match registry
        .update_status("swarm-missing", SwarmStatus::Active)
        .await
    {
        Err(SwarmError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_is_monotonic() {
    let redis = require_redis!();
    let registry = SwarmRegistry::new(redis, common::test_keys("registry-heartbeat"));

    registry.register(&SwarmRecord::new("swarm-a")).await.unwrap();
    let before = registry.get_swarm("swarm-a").await.unwrap().last_heartbeat_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.heartbeat("swarm-a").await.unwrap();
    let after = registry.get_swarm("swarm-a").await.unwrap().last_heartbeat_at;
    assert!(after >= before);

    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.heartbeat("swarm-a").await.unwrap();
    let again = registry.get_swarm("swarm-a").await.unwrap().last_heartbeat_at;
    assert!(again >= after);

    match registry.heartbeat("swarm-missing").await {
        Err(SwarmError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn list_swarms_filters() {
    let redis = require_redis!();
    let registry = SwarmRegistry::new(redis, common::test_keys("registry-list"));

    let gpu = SwarmRecord::new("gpu-swarm")
        .with_capabilities(["gpu"])
        .with_priority(SwarmPriority::High);
    let cpu = SwarmRecord::new("cpu-swarm").with_capabilities(["cpu"]);
    registry.register(&gpu).await.unwrap();
    registry.register(&cpu).await.unwrap();
    registry
        .update_status("gpu-swarm", SwarmStatus::Active)
        .await
        .unwrap();

    let all = registry.list_swarms(&SwarmFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let active = registry.list_swarms(&SwarmFilter::active()).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].swarm_id, "gpu-swarm");

    let by_capability = registry
        .list_swarms(&SwarmFilter {
            capability: Some("cpu".into()),
            ..SwarmFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_capability.len(), 1);
    assert_eq!(by_capability[0].swarm_id, "cpu-swarm");

    let by_priority = registry
        .list_swarms(&SwarmFilter {
            priority: Some(SwarmPriority::High),
            ..SwarmFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_priority.len(), 1);
}

#[tokio::test]
async fn deregister_is_idempotent() {
    let redis = require_redis!();
    let registry = SwarmRegistry::new(redis, common::test_keys("registry-deregister"));

    registry.register(&SwarmRecord::new("swarm-a")).await.unwrap();
    registry.deregister("swarm-a", "test teardown").await.unwrap();
    // second call must succeed with nothing left to remove
    registry.deregister("swarm-a", "test teardown").await.unwrap();

    match registry.get_swarm("swarm-a").await {
        Err(SwarmError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn sweep_marks_stale_active_swarms() {
    let redis = require_redis!();
    let registry = Arc::new(SwarmRegistry::new(
        redis,
        common::test_keys("registry-sweep"),
    ));

    registry.register(&SwarmRecord::new("stale-swarm")).await.unwrap();
    registry
        .update_status("stale-swarm", SwarmStatus::Active)
        .await
        .unwrap();
    registry.register(&SwarmRecord::new("fresh-swarm")).await.unwrap();
    registry
        .update_status("fresh-swarm", SwarmStatus::Active)
        .await
        .unwrap();

    // let the stale record age past the threshold, keep the fresh one alive
    tokio::time::sleep(Duration::from_millis(300)).await;
    registry.heartbeat("fresh-swarm").await.unwrap();

    let interrupted = registry
        .sweep_interrupted(Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(interrupted, vec!["stale-swarm".to_string()]);

    let stale = registry.get_swarm("stale-swarm").await.unwrap();
    assert_eq!(stale.status, SwarmStatus::Interrupted);
    let fresh = registry.get_swarm("fresh-swarm").await.unwrap();
    assert_eq!(fresh.status, SwarmStatus::Active);

    // a second sweep finds nothing new
    let again = registry
        .sweep_interrupted(Duration::from_millis(200))
        .await
        .unwrap();
    assert!(again.is_empty());
}
