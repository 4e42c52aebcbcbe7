pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};
use ruma::{CanonicalJsonObject, CanonicalJsonValue};
use serde::Serialize;

use crate::{types::Event, Result};

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub fn base64_encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD_NO_PAD.encode(bytes)
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD_NO_PAD
        .decode(s)
        .map_err(|_| crate::Error::BadData("invalid base64"))
}

pub fn base64_encode_url_safe(bytes: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn base64_decode_url_safe(s: &str) -> Result<Vec<u8>> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| crate::Error::BadData("invalid base64"))
}

/// Serialize a value into a canonical JSON object.
pub fn to_canonical_object<T: Serialize>(value: T) -> Result<CanonicalJsonObject> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => {
            let mut object = CanonicalJsonObject::new();
            for (key, json) in map {
                object.insert(key, CanonicalJsonValue::try_from(json).map_err(|_| {
                    crate::Error::BadData("value is not canonical JSON")
                })?);
            }
            Ok(object)
        }
        _ => Err(crate::Error::BadData("value is not a JSON object")),
    }
}

/// Sort events into a DAG-plausible order: by depth, then by origin
/// timestamp, then by ID for a stable tiebreak.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.depth
            .cmp(&b.depth)
            .then_with(|| a.origin_server_ts.cmp(&b.origin_server_ts))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_round_trip() {
        let bytes = [0u8, 1, 2, 250, 251, 252, 253, 254, 255];
        assert_eq!(base64_decode(&base64_encode(&bytes)).unwrap(), bytes);
        assert_eq!(
            base64_decode_url_safe(&base64_encode_url_safe(&bytes)).unwrap(),
            bytes
        );
        // Unpadded: encoding never emits '='
        assert!(!base64_encode(b"ab").contains('='));
        assert!(!base64_encode_url_safe(b"ab").contains('='));
    }

    #[test]
    fn test_to_canonical_object() {
        #[derive(serde::Serialize)]
        struct Probe {
            a: u8,
            b: &'static str,
        }
        let object = to_canonical_object(Probe { a: 1, b: "two" }).unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["b"], CanonicalJsonValue::String("two".to_owned()));
    }
}
