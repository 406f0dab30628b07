//! Common test utilities for integration tests.
//!
//! Redis-backed tests need a live server; set `ZAGARA_TEST_REDIS_URL`
//! (e.g. `redis://127.0.0.1:6379`) to enable them. Without it they skip.

use std::time::Duration;

use uuid::Uuid;
use zagara::domain::models::CoordinatorConfig;
use zagara::infrastructure::redis::{KeySpace, RedisHandle};

/// The Redis URL for integration tests, if configured.
pub fn redis_url() -> Option<String> {
    std::env::var("ZAGARA_TEST_REDIS_URL").ok()
}

/// Connect to the test Redis, or `None` to skip the test.
#[allow(dead_code)]
pub async fn test_redis() -> Option<RedisHandle> {
    let url = redis_url()?;
    Some(
        RedisHandle::connect(&url)
            .await
            .expect("could not connect to test redis"),
    )
}

/// A key prefix unique to one test run, so parallel tests never collide.
#[allow(dead_code)]
pub fn unique_prefix(label: &str) -> String {
    format!("zagara-test:{label}:{}", Uuid::new_v4().simple())
}

/// Keys under a unique prefix.
#[allow(dead_code)]
pub fn test_keys(label: &str) -> KeySpace {
    KeySpace::new(unique_prefix(label))
}

/// Coordinator config tuned for fast tests: short lease, fast heartbeats.
#[allow(dead_code)]
pub fn test_config(label: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        key_prefix: unique_prefix(label),
        redis_url: redis_url().unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
        leader_ttl_secs: 2,
        leader_renew_interval_secs: 1,
        heartbeat_interval_secs: 1,
        interrupt_threshold_secs: 4,
        dispatch_interval_secs: 1,
        health_interval_secs: 1,
        resource_advisory_interval_secs: 5,
        ..CoordinatorConfig::default()
    }
}

/// Poll until the coordinator reports leadership or the timeout elapses.
#[allow(dead_code)]
pub async fn wait_until_leader(
    coordinator: &std::sync::Arc<zagara::services::SwarmCoordinator>,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if coordinator.is_leader() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll until the coordinator observes `expected` as the current leader.
#[allow(dead_code)]
pub async fn wait_until_leader_is(
    coordinator: &std::sync::Arc<zagara::services::SwarmCoordinator>,
    expected: &str,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if coordinator.current_leader().await.as_deref() == Some(expected) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Initialize test logging once.
#[allow(dead_code)]
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
