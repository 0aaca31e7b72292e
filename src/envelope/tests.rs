use super::*;

use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    id: u32,
    sku: String,
}

#[test]
fn test_new_performs_no_validation() {
    let envelope = Envelope::new(Headers::new(), b"not json".to_vec());
    assert!(envelope.headers.is_empty());
    assert_eq!(envelope.message_name(), "");
    assert!(envelope.destination().is_none());
}

#[test]
fn test_header_accessors() {
    let mut h = Headers::new();
    h.insert(headers::MESSAGE_NAME.to_string(), "OrderPlaced".to_string());
    h.insert(
        headers::MESSAGE_FULL_NAME.to_string(),
        "shop::OrderPlaced".to_string(),
    );
    h.insert(headers::DESTINATION.to_string(), "billing".to_string());
    let envelope = Envelope::new(h, Vec::new());

    assert_eq!(envelope.message_name(), "OrderPlaced");
    assert_eq!(envelope.message_full_name(), Some("shop::OrderPlaced"));
    assert_eq!(envelope.destination(), Some("billing"));
    assert!(envelope.error().is_none());
}

#[test]
fn test_set_header_replaces_existing() {
    let mut envelope = Envelope::default();
    envelope.set_header(headers::ERROR, "first");
    envelope.set_header(headers::ERROR, "second");
    assert_eq!(envelope.error(), Some("second"));
    assert_eq!(envelope.headers.len(), 1);
}

#[test]
fn test_decode_body() {
    let body = serde_json::to_vec(&OrderPlaced {
        id: 7,
        sku: "A-1".to_string(),
    })
    .unwrap();
    let envelope = Envelope::new(Headers::new(), body);

    let decoded: OrderPlaced = envelope.decode().unwrap();
    assert_eq!(
        decoded,
        OrderPlaced {
            id: 7,
            sku: "A-1".to_string()
        }
    );
}

#[test]
fn test_decode_body_wrong_shape() {
    let envelope = Envelope::new(Headers::new(), b"{\"unrelated\":true}".to_vec());
    assert!(envelope.decode::<OrderPlaced>().is_err());
}
