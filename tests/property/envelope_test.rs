// tests/property/envelope_test.rs

//! Property-based tests for the wire envelope and client messages.

use proptest::prelude::*;
use spinelgate::core::protocol::envelope::{decode, encode};
use spinelgate::core::protocol::message::{Post, RequestMessage, RequestPayload};
use spinelgate::core::protocol::storage::MessageKind;
use spinelgate::core::protocol::{Delivery, Envelope, EnvelopeType};

fn envelope_type() -> impl Strategy<Value = EnvelopeType> {
    prop::sample::select(vec![
        EnvelopeType::Request,
        EnvelopeType::Response,
        EnvelopeType::StorageRequest,
        EnvelopeType::StorageResponse,
        EnvelopeType::LegacyText,
    ])
}

fn message_kind() -> impl Strategy<Value = MessageKind> {
    prop::sample::select(vec![MessageKind::Text, MessageKind::Image, MessageKind::File])
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_envelope_survives_the_wire(
        kind in envelope_type(),
        payload in prop::collection::vec(any::<u8>(), 0..2048)
    ) {
        let envelope = Envelope::new(kind, payload);
        let bytes = envelope.encode().unwrap();
        prop_assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_decode_rejects_trailing_bytes(
        kind in envelope_type(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
        trailer in prop::collection::vec(any::<u8>(), 1..16)
    ) {
        let mut bytes = Envelope::new(kind, payload).encode().unwrap();
        bytes.extend_from_slice(&trailer);
        prop_assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_envelope_is_rejected(
        kind in envelope_type(),
        payload in prop::collection::vec(any::<u8>(), 1..256),
        cut in 1usize..64
    ) {
        let bytes = Envelope::new(kind, payload).encode().unwrap();
        let keep = bytes.len().saturating_sub(cut);
        prop_assert!(Envelope::decode(&bytes[..keep]).is_err());
    }

    #[test]
    fn test_delivery_inside_envelope(
        target in "[a-zA-Z0-9_:-]{1,64}",
        payload in prop::collection::vec(any::<u8>(), 0..1024)
    ) {
        let delivery = Delivery { target_user_id: target, payload };
        let envelope = Envelope::wrap(EnvelopeType::Request, &delivery).unwrap();
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded.kind, EnvelopeType::Request);
        prop_assert_eq!(decoded.open::<Delivery>().unwrap(), delivery);
    }

    #[test]
    fn test_post_request_survives_the_wire(
        token in "[a-zA-Z0-9]{0,64}",
        to_id in "[a-zA-Z0-9_-]{1,32}",
        content in prop::collection::vec(any::<u8>(), 0..512),
        kind in message_kind(),
        is_group in any::<bool>(),
        timestamp in any::<i64>()
    ) {
        let request = RequestMessage {
            token,
            payload: RequestPayload::Post(Post {
                from_id: String::new(),
                to_id,
                content,
                kind,
                is_group,
                timestamp,
            }),
        };
        let bytes = encode(&request).unwrap();
        prop_assert_eq!(decode::<RequestMessage>(&bytes).unwrap(), request);
    }

    #[test]
    fn test_random_bytes_never_panic_the_decoder(
        bytes in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let _ = Envelope::decode(&bytes);
        let _ = decode::<RequestMessage>(&bytes);
    }
}
