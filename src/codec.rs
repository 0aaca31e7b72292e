//! Body encoding.
//!
//! Bodies are JSON: cross-language, and fields stay introspectable by name
//! at the application boundary.

use serde::{de::DeserializeOwned, Serialize};

/// Content type of encoded bodies.
pub const CONTENT_TYPE: &str = "application/json";

/// Encode a payload into an envelope body.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(payload)
}

/// Decode an envelope body into a payload.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde::{Deserialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Shipment {
        order_id: u64,
        lines: BTreeMap<String, u32>,
    }

    struct Unencodable;
    impl Serialize for Unencodable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refuses to serialize"))
        }
    }

    #[test]
    fn test_body_fields_are_named() {
        let body = encode(&Shipment {
            order_id: 9,
            lines: BTreeMap::from([("sku-1".to_string(), 2)]),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["order_id"], 9);
        assert_eq!(value["lines"]["sku-1"], 2);
    }

    #[test]
    fn test_encode_failure_surfaces() {
        let err = encode(&Unencodable).unwrap_err();
        assert!(err.to_string().contains("refuses to serialize"));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode::<Shipment>(b"\x00\x01").is_err());
    }
}
