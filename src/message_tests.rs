//! Tests for message types and the payload codec.

use super::*;
use serde_json::json;

// ============================================================================
// Payload Codec Tests
// ============================================================================

mod payload_codec {
    use super::*;

    /// Verify a structured payload survives the wire form unchanged.
    #[test]
    fn test_encode_decode_round_trip() {
        let payload = json!({
            "event": "order.created",
            "order_id": 42,
            "tags": ["a", "b"],
            "nested": { "flag": true }
        });

        let encoded = encode_payload(&payload).unwrap();
        let decoded = decode_payload(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, payload);
    }

    /// Verify key order in the wire form is irrelevant to equality.
    #[test]
    fn test_key_order_irrelevant() {
        let a = decode_payload(br#"{"x": 1, "y": 2}"#).unwrap();
        let b = decode_payload(br#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(a, b);
    }

    /// Verify non-object JSON values are accepted; no schema is enforced.
    #[test]
    fn test_scalar_and_array_payloads() {
        assert_eq!(decode_payload(b"3").unwrap(), json!(3));
        assert_eq!(decode_payload(b"[1,2]").unwrap(), json!([1, 2]));
        assert_eq!(decode_payload(b"\"ok\"").unwrap(), json!("ok"));
        assert_eq!(decode_payload(b"null").unwrap(), json!(null));
    }

    /// Verify malformed JSON reports a decode error.
    #[test]
    fn test_invalid_json_rejected() {
        let err = decode_payload(b"{not json").unwrap_err();
        assert!(matches!(err, QueueError::Decode(DecodeError::Json(_))));
    }

    /// Verify non-UTF-8 bytes report a decode error before JSON parsing.
    #[test]
    fn test_invalid_utf8_rejected() {
        let err = decode_payload(&[0xff, 0xfe, 0x01]).unwrap_err();
        assert!(matches!(err, QueueError::Decode(DecodeError::InvalidUtf8)));
    }
}

// ============================================================================
// Queue Name Tests
// ============================================================================

mod queue_names {
    use super::*;
    use std::str::FromStr;

    /// Verify valid names are accepted, including Kafka topic dots.
    #[test]
    fn test_valid_names() {
        for name in ["orders", "orders-v2", "orders_v2", "events.orders.created", "q1"] {
            assert!(QueueName::new(name.to_string()).is_ok(), "rejected: {}", name);
        }
    }

    /// Verify empty and oversized names are rejected.
    #[test]
    fn test_length_bounds() {
        assert!(QueueName::new(String::new()).is_err());
        assert!(QueueName::new("a".repeat(260)).is_ok());
        assert!(QueueName::new("a".repeat(261)).is_err());
    }

    /// Verify names with disallowed characters are rejected.
    #[test]
    fn test_invalid_characters() {
        for name in ["has space", "slash/name", "colon:name", "ünïcode"] {
            assert!(QueueName::new(name.to_string()).is_err(), "accepted: {}", name);
        }
    }

    /// Verify FromStr and Display round-trip.
    #[test]
    fn test_from_str_display() {
        let name = QueueName::from_str("orders").unwrap();
        assert_eq!(name.as_str(), "orders");
        assert_eq!(name.to_string(), "orders");
    }
}

// ============================================================================
// Delivery Handle Tests
// ============================================================================

mod delivery_handles {
    use super::*;
    use crate::config::BackendType;

    /// Verify the None handle marks no-ack backends.
    #[test]
    fn test_none_handle() {
        let handle = DeliveryHandle::None;
        assert!(handle.is_none());
        assert_eq!(handle.backend_type(), None);
    }

    /// Verify each backend variant reports its backend.
    #[test]
    fn test_backend_variants() {
        let amqp = DeliveryHandle::Amqp { delivery_tag: 7 };
        assert_eq!(amqp.backend_type(), Some(BackendType::Amqp));
        assert!(!amqp.is_none());

        let kafka = DeliveryHandle::Kafka {
            topic: "orders".to_string(),
            partition: 3,
            offset: 120,
        };
        assert_eq!(kafka.backend_type(), Some(BackendType::Kafka));

        let sqs = DeliveryHandle::Sqs {
            queue: QueueName::new("orders".to_string()).unwrap(),
            receipt: "r-1".to_string(),
        };
        assert_eq!(sqs.backend_type(), Some(BackendType::Sqs));

        let memory = DeliveryHandle::Memory {
            receipt: "r-2".to_string(),
        };
        assert_eq!(memory.backend_type(), Some(BackendType::Memory));
    }

    /// Verify a delivered message carries its handle and payload together.
    #[test]
    fn test_delivered_message() {
        let payload = serde_json::json!({"k": "v"});
        let message = DeliveredMessage::new(
            DeliveryHandle::Memory {
                receipt: "r".to_string(),
            },
            payload.clone(),
        );
        assert_eq!(message.payload, payload);
        assert!(!message.handle.is_none());
    }
}
