//! Resource arbiter integration tests against a live Redis.
//!
//! Skipped unless `ZAGARA_TEST_REDIS_URL` is set.

mod common;

use zagara::domain::errors::SwarmError;
use zagara::services::ResourceArbiter;

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
async fn allocation_round_trip_conserves_the_pool() {
    let redis = require_redis!();
    let arbiter = ResourceArbiter::new(redis, common::test_keys("arbiter-roundtrip"));

    assert!(arbiter.create_pool("cpu", 100).await.unwrap());
    // seeding twice leaves the pool untouched
    assert!(!arbiter.create_pool("cpu", 999).await.unwrap());

    let allocation = arbiter.allocate("cpu", "swarm-a", 30).await.unwrap();
    assert_eq!(allocation.amount, 30);

    let snapshot = arbiter.pool_snapshot("cpu").await.unwrap();
    assert_eq!(snapshot.available, 70);
    assert_eq!(snapshot.allocations.get("swarm-a"), Some(&30));
    assert_eq!(snapshot.accounted_total(), 100);

    // more than is available is denied without touching the pool
    match arbiter.allocate("cpu", "swarm-b", 80).await {
        Err(SwarmError::InsufficientResources {
            requested,
            available,
            ..
        }) => {
            assert_eq!(requested, 80);
            assert_eq!(available, 70);
        }
        other => panic!("expected InsufficientResources, got {other:?}"),
    }
    assert_eq!(arbiter.pool_snapshot("cpu").await.unwrap().available, 70);

    // exactly what is available succeeds
    arbiter.allocate("cpu", "swarm-b", 70).await.unwrap();
    assert_eq!(arbiter.pool_snapshot("cpu").await.unwrap().available, 0);
    // one more unit fails
    assert!(arbiter.allocate("cpu", "swarm-b", 1).await.is_err());

    arbiter.release("cpu", "swarm-b", 70).await.unwrap();
    let available = arbiter.release("cpu", "swarm-a", 30).await.unwrap();
    assert_eq!(available, 100);

    let snapshot = arbiter.pool_snapshot("cpu").await.unwrap();
    assert_eq!(snapshot.available, 100);
    assert!(snapshot.allocations.is_empty());
}

#[tokio::test]
async fn invalid_amounts_are_rejected() {
    let redis = require_redis!();
    let arbiter = ResourceArbiter::new(redis, common::test_keys("arbiter-invalid"));

    arbiter.create_pool("memory", 10).await.unwrap();

    assert!(matches!(
        arbiter.allocate("memory", "swarm-a", 0).await,
        Err(SwarmError::InvalidAmount(0))
    ));
    assert!(matches!(
        arbiter.allocate("memory", "swarm-a", -5).await,
        Err(SwarmError::InvalidAmount(-5))
    ));
    assert!(matches!(
        arbiter.create_pool("bogus", 0).await,
        Err(SwarmError::InvalidAmount(0))
    ));

    // releasing more than is held is rejected
    arbiter.allocate("memory", "swarm-a", 4).await.unwrap();
    assert!(arbiter.release("memory", "swarm-a", 5).await.is_err());
    assert_eq!(arbiter.pool_snapshot("memory").await.unwrap().available, 6);
}

#[tokio::test]
async fn allocating_from_a_missing_pool_fails() {
    let redis = require_redis!();
    let arbiter = ResourceArbiter::new(redis, common::test_keys("arbiter-missing"));

    match arbiter.allocate("ghost", "swarm-a", 1).await {
        Err(SwarmError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn deallocate_all_returns_everything() {
    let redis = require_redis!();
    let arbiter = ResourceArbiter::new(redis, common::test_keys("arbiter-deallocate"));

    arbiter.create_pool("cpu", 50).await.unwrap();
    arbiter.create_pool("memory", 200).await.unwrap();
    arbiter.allocate("cpu", "swarm-a", 20).await.unwrap();
    arbiter.allocate("memory", "swarm-a", 64).await.unwrap();
    arbiter.allocate("cpu", "swarm-b", 5).await.unwrap();

    let returned = arbiter.deallocate_all("swarm-a").await.unwrap();
    assert_eq!(returned.len(), 2);

    assert_eq!(arbiter.pool_snapshot("cpu").await.unwrap().available, 45);
    assert_eq!(arbiter.pool_snapshot("memory").await.unwrap().available, 200);
    assert_eq!(arbiter.allocation("cpu", "swarm-a").await.unwrap(), 0);
    assert_eq!(arbiter.allocation("cpu", "swarm-b").await.unwrap(), 5);

    // idempotent: nothing further to return
    let again = arbiter.deallocate_all("swarm-a").await.unwrap();
    assert!(again.is_empty());
}
