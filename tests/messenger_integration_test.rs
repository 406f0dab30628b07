//! Messenger integration tests against a live Redis.
//!
//! Skipped unless `ZAGARA_TEST_REDIS_URL` is set.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use zagara::domain::errors::SwarmError;
use zagara::domain::models::MessageEnvelope;
use zagara::domain::ports::handler_fn;
use zagara::infrastructure::codec::JsonCodec;
use zagara::infrastructure::redis::KeySpace;
use zagara::services::messenger::{MessengerConfig, SwarmMessenger};

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

async fn messenger(swarm_id: &str, keys: &KeySpace) -> Arc<SwarmMessenger> {
    let redis = common::test_redis().await.expect("redis gate checked");
    let messenger = Arc::new(SwarmMessenger::new(
        swarm_id,
        redis,
        keys.clone(),
        Arc::new(JsonCodec::new(1024 * 1024)),
        MessengerConfig::default(),
    ));
    messenger.start().await.unwrap();
    // give the subscriber a moment to establish subscriptions
    tokio::time::sleep(Duration::from_millis(150)).await;
    messenger
}

#[tokio::test]
async fn targeted_message_reaches_exactly_one_swarm() {
    let _ = require_redis!();
    let keys = common::test_keys("msg-targeted");

    let swarm_a = messenger("swarm-a", &keys).await;
    let swarm_b = messenger("swarm-b", &keys).await;
    let swarm_c = messenger("swarm-c", &keys).await;

    let (tx, mut rx) = mpsc::channel::<MessageEnvelope>(4);
    swarm_b
        .on_message(
            "ping",
            handler_fn(move |envelope| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(envelope).await;
                }
            }),
        )
        .await;
    let c_hits = Arc::new(AtomicU64::new(0));
    {
        let c_hits = c_hits.clone();
        swarm_c
            .on_message(
                "ping",
                handler_fn(move |_| {
                    let c_hits = c_hits.clone();
                    async move {
                        c_hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await;
    }

    swarm_a
        .send_to("swarm-b", json!({"type": "ping", "n": 42}))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler should fire")
        .expect("channel open");
    assert_eq!(received.from_swarm, "swarm-a");
    assert_eq!(received.payload["n"], 42);

    // no duplicate delivery, and swarm-c saw nothing
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(c_hits.load(Ordering::SeqCst), 0);

    swarm_a.close().await;
    swarm_b.close().await;
    swarm_c.close().await;
}

#[tokio::test]
async fn own_broadcasts_are_suppressed() {
    let _ = require_redis!();
    let keys = common::test_keys("msg-loopback");

    let swarm_a = messenger("swarm-a", &keys).await;
    let swarm_b = messenger("swarm-b", &keys).await;

    let a_hits = Arc::new(AtomicU64::new(0));
    {
        let a_hits = a_hits.clone();
        swarm_a
            .on_message(
                "announce",
                handler_fn(move |_| {
                    let a_hits = a_hits.clone();
                    async move {
                        a_hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await;
    }
    let (tx, mut rx) = mpsc::channel::<MessageEnvelope>(4);
    swarm_b
        .on_message(
            "announce",
            handler_fn(move |envelope| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(envelope).await;
                }
            }),
        )
        .await;

    swarm_a
        .broadcast(json!({"type": "announce", "round": 1}))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("swarm-b should hear the broadcast")
        .unwrap();
    assert_eq!(received.from_swarm, "swarm-a");

    // the sender subscribes to the global channel too, but must drop its own
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a_hits.load(Ordering::SeqCst), 0);
    assert!(swarm_a.stats().loopback_dropped >= 1);

    swarm_a.close().await;
    swarm_b.close().await;
}

#[tokio::test]
async fn request_response_round_trip() {
    let _ = require_redis!();
    let keys = common::test_keys("msg-request");

    let swarm_a = messenger("swarm-a", &keys).await;
    let swarm_b = messenger("swarm-b", &keys).await;

    {
        let responder = swarm_b.clone();
        swarm_b
            .on_message(
                "echo",
                handler_fn(move |envelope| {
                    let responder = responder.clone();
                    async move {
                        let value = envelope.payload["v"].clone();
                        let _ = responder.respond(&envelope, json!({ "v": value })).await;
                    }
                }),
            )
            .await;
    }

    let response = swarm_a
        .request(
            "swarm-b",
            json!({"type": "echo", "v": "hi"}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(response.payload["v"], "hi");
    assert_eq!(response.from_swarm, "swarm-b");

    swarm_a.close().await;
    swarm_b.close().await;
}

#[tokio::test]
async fn request_times_out_without_responder() {
    let _ = require_redis!();
    let keys = common::test_keys("msg-timeout");

    let swarm_a = messenger("swarm-a", &keys).await;
    let swarm_b = messenger("swarm-b", &keys).await;
    // swarm-b registers no handler: the request must time out

    let started = tokio::time::Instant::now();
    let outcome = swarm_a
        .request(
            "swarm-b",
            json!({"type": "echo", "v": "hi"}),
            Duration::from_millis(500),
        )
        .await;
    let elapsed = started.elapsed();

    match outcome {
        Err(SwarmError::Timeout(_)) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(450));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(swarm_a.stats().request_timeouts, 1);

    swarm_a.close().await;
    swarm_b.close().await;
}

#[tokio::test]
async fn remote_errors_surface() {
    let _ = require_redis!();
    let keys = common::test_keys("msg-remote-error");

    let swarm_a = messenger("swarm-a", &keys).await;
    let swarm_b = messenger("swarm-b", &keys).await;

    {
        let responder = swarm_b.clone();
        swarm_b
            .on_message(
                "work",
                handler_fn(move |envelope| {
                    let responder = responder.clone();
                    async move {
                        let _ = responder.respond_error(&envelope, "queue full").await;
                    }
                }),
            )
            .await;
    }

    match swarm_a
        .request("swarm-b", json!({"type": "work"}), Duration::from_secs(1))
        .await
    {
        Err(SwarmError::RemoteError { swarm_id, message }) => {
            assert_eq!(swarm_id, "swarm-b");
            assert_eq!(message, "queue full");
        }
        other => panic!("expected RemoteError, got {other:?}"),
    }

    swarm_a.close().await;
    swarm_b.close().await;
}

#[tokio::test]
async fn history_is_bounded_and_replayable() {
    let _ = require_redis!();
    let keys = common::test_keys("msg-history");

    let redis = common::test_redis().await.unwrap();
    let messenger = Arc::new(SwarmMessenger::new(
        "swarm-a",
        redis,
        keys.clone(),
        Arc::new(JsonCodec::new(1024 * 1024)),
        MessengerConfig {
            message_retention: 5,
            message_ttl: Duration::from_secs(60),
        },
    ));
    messenger.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    for n in 0..12 {
        messenger
            .broadcast(json!({"type": "tick", "n": n}))
            .await
            .unwrap();
    }

    let channel = keys.global_channel();
    let history = messenger.get_history(&channel, 50).await.unwrap();
    assert_eq!(history.len(), 5, "history must be trimmed to retention");
    // newest first: the last published entry leads
    assert_eq!(history[0].payload["n"], 11);
    assert_eq!(history[4].payload["n"], 7);

    messenger.close().await;
}
