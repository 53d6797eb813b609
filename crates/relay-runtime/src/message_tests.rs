//! Tests for message types and the JSON codec.

use super::*;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Notification {
    #[serde(rename = "type")]
    kind: String,
    to: String,
}

#[test]
fn test_queue_handle_validation() {
    assert!(QueueHandle::new("orders", "/queue/orders").is_ok());
    assert!(QueueHandle::new(
        "orders",
        "https://sqs.us-east-1.amazonaws.com/123456789012/orders"
    )
    .is_ok());

    assert!(QueueHandle::new("", "/queue/orders").is_err());
    assert!(QueueHandle::new("orders", "").is_err());
    assert!(QueueHandle::new("orders", "/queue/or|ders").is_err());
}

#[test]
fn test_queue_handle_accessors() {
    let handle = QueueHandle::new("orders", "/queue/orders").unwrap();
    assert_eq!(handle.name(), "orders");
    assert_eq!(handle.path(), "/queue/orders");
    assert_eq!(handle.to_string(), "orders");
}

#[test]
fn test_codec_round_trip() {
    let payload = Notification {
        kind: "welcome".to_string(),
        to: "a@b.com".to_string(),
    };

    let body = encode(&payload).unwrap();
    let decoded: Notification = decode(&body).unwrap();
    assert_eq!(decoded, payload);
}

#[test]
fn test_decode_rejects_malformed_json() {
    let body = Bytes::from_static(b"this is not json");
    let result: Result<Notification, _> = decode(&body);
    assert!(result.is_err());
}

#[test]
fn test_decode_rejects_invalid_utf8() {
    let body = Bytes::from_static(&[0xff, 0xfe, 0x00]);
    let result: Result<Notification, _> = decode(&body);
    assert!(matches!(result, Err(SerializationError::InvalidUtf8)));
}

#[test]
fn test_decode_rejects_wrong_shape() {
    // Valid JSON, wrong type
    let body = Bytes::from_static(b"[1, 2, 3]");
    let result: Result<Notification, _> = decode(&body);
    assert!(matches!(result, Err(SerializationError::Json(_))));
}

#[test]
fn test_envelope_retains_ack_token() {
    let ack = AckToken::new("tok-1".to_string(), crate::provider::BackendKind::Memory);
    let raw = RawMessage::new(
        Bytes::from_static(b"{\"type\":\"welcome\",\"to\":\"a@b.com\"}"),
        ack.clone(),
    );

    let envelope: Envelope<Notification> = Envelope::open(&raw).unwrap();
    assert_eq!(envelope.ack, ack);
    assert_eq!(envelope.payload.kind, "welcome");
}

#[test]
fn test_send_receipt() {
    let receipt = SendReceipt::new("msg-123");
    assert_eq!(receipt.id(), "msg-123");
}
