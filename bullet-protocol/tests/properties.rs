//! Property-based tests for the wire codec.
//!
//! - Any message survives encode/decode and still verifies
//! - The decoder never panics on arbitrary input
//! - Corrupting one payload byte never goes unnoticed
//!
//! The action fuzz lives next to the state it drives, in `safety.rs`.

use proptest::prelude::*;
use serde_json::{Value, json};

use bullet_protocol::codec::{self, HEADER_LEN, Message, MessageKind};
use bullet_protocol::state::{AcceptorId, Term};

// ============================================================================
// GENERATORS
// ============================================================================

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Prepare),
        Just(MessageKind::Promise),
        Just(MessageKind::Accept),
        Just(MessageKind::Accepted),
    ]
}

/// Scalars and short arrays whose compact JSON form is unique.
fn arb_value() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-zA-Z0-9]{0,16}".prop_map(Value::from),
        Just(Value::Null),
    ];
    prop_oneof![
        3 => scalar.clone(),
        1 => prop::collection::vec(scalar, 0..4).prop_map(Value::Array),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        arb_kind(),
        any::<AcceptorId>(),
        any::<Term>(),
        prop::collection::vec(arb_value(), 0..8),
    )
        .prop_map(|(kind, sender, term, values)| Message::new(kind, sender, term, values))
}

// ============================================================================
// CODEC PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn prop_roundtrip(message in arb_message()) {
        let bytes = codec::encode(&message).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        prop_assert!(decoded.verify());
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode(&bytes);
    }

    #[test]
    fn prop_payload_corruption_is_detected(
        message in arb_message(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut bytes = codec::encode(&message).unwrap();
        let payload_len = bytes.len() - HEADER_LEN - codec::TAG_LEN;
        let pos = HEADER_LEN + index.index(payload_len);
        bytes[pos] ^= flip;

        match codec::decode(&bytes) {
            Ok(decoded) => prop_assert!(!decoded.verify()),
            Err(_) => {}
        }
    }
}

#[test]
fn test_flipped_payload_byte_fails_verify() {
    let message = Message::accept(0, 1, vec![json!("v1")]);
    let mut bytes = codec::encode(&message).unwrap();
    bytes[HEADER_LEN + 2] ^= 0x01;
    let decoded = codec::decode(&bytes).unwrap();
    assert!(!decoded.verify());
}
