//! Property tests for the wire codec: decode(encode(e)) is the identity
//! for every envelope under the size limit.

use proptest::prelude::*;
use serde_json::{json, Value};
use zagara::domain::models::MessageEnvelope;
use zagara::domain::ports::MessageCodec;
use zagara::infrastructure::codec::JsonCodec;

fn arb_id() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}"
}

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[ -~]{0,32}".prop_map(Value::from),
    ]
}

fn arb_payload() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,8}", arb_scalar(), 0..6).prop_map(|map| {
        let mut object = serde_json::Map::new();
        for (key, value) in map {
            object.insert(key, value);
        }
        Value::Object(object)
    })
}

proptest! {
    #[test]
    fn targeted_envelopes_round_trip(from in arb_id(), to in arb_id(), payload in arb_payload()) {
        let codec = JsonCodec::new(1024 * 1024);
        let envelope = MessageEnvelope::targeted(from, to, payload);
        let bytes = codec.encode(&envelope).unwrap();
        let back = codec.decode(&bytes).unwrap();
        prop_assert_eq!(envelope, back);
    }

    #[test]
    fn broadcast_envelopes_round_trip(from in arb_id(), payload in arb_payload()) {
        let codec = JsonCodec::new(1024 * 1024);
        let envelope = MessageEnvelope::broadcast(from, payload);
        let bytes = codec.encode(&envelope).unwrap();
        let back = codec.decode(&bytes).unwrap();
        prop_assert_eq!(envelope, back);
    }

    #[test]
    fn agent_envelopes_round_trip(
        from in arb_id(),
        to in arb_id(),
        agent in arb_id(),
        payload in arb_payload(),
    ) {
        let codec = JsonCodec::new(1024 * 1024);
        let envelope = MessageEnvelope::agent(from, to, agent, payload);
        let bytes = codec.encode(&envelope).unwrap();
        let back = codec.decode(&bytes).unwrap();
        prop_assert_eq!(envelope, back);
    }

    #[test]
    fn request_response_pairs_round_trip(from in arb_id(), to in arb_id(), payload in arb_payload()) {
        let codec = JsonCodec::new(1024 * 1024);
        let request = MessageEnvelope::request(from, to.clone(), payload);
        let response = MessageEnvelope::response_to(&request, to, json!({"ok": true}));

        let bytes = codec.encode(&response).unwrap();
        let back = codec.decode(&bytes).unwrap();
        prop_assert_eq!(back.request_id, Some(request.id));
        prop_assert_eq!(response, back);
    }
}

#[test]
fn batch_decode_matches_individual_decode() {
    let codec = JsonCodec::new(1024 * 1024);
    let frames: Vec<Vec<u8>> = (0..10)
        .map(|n| {
            codec
                .encode(&MessageEnvelope::broadcast("swarm-a", json!({"n": n})))
                .unwrap()
        })
        .collect();

    let batch = codec.batch_decode(&frames);
    assert_eq!(batch.len(), frames.len());
    for (frame, result) in frames.iter().zip(batch) {
        assert_eq!(codec.decode(frame).unwrap(), result.unwrap());
    }
}
