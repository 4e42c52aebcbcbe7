use std::collections::BTreeMap;

use crate::database::Versionstamp;
use crate::{utils, Error, Result};

/// Stream keys, one per database a sync position spans.
pub const ROOMS_STREAM: &str = "r";
pub const ACCOUNTS_STREAM: &str = "a";
pub const DEVICES_STREAM: &str = "d";

/// Per-stream sync positions. Serialized as msgpack of
/// `{stream_key: versionstamp_bytes}` for storage; on the wire each stream
/// renders as `key + base64url(versionstamp_bytes)`, streams joined by `.`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionMap(BTreeMap<String, Versionstamp>);

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream: &str) -> Option<Versionstamp> {
        self.0.get(stream).copied()
    }

    pub fn set(&mut self, stream: &str, version: Versionstamp) {
        self.0.insert(stream.to_owned(), version);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_msgpack(&self) -> Vec<u8> {
        let raw: BTreeMap<&str, serde_bytes_compat::Bytes> = self
            .0
            .iter()
            .map(|(key, version)| {
                (
                    key.as_str(),
                    serde_bytes_compat::Bytes(version.to_bytes().to_vec()),
                )
            })
            .collect();
        rmp_serde::to_vec(&raw).expect("version map serializes")
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let raw: BTreeMap<String, serde_bytes_compat::Bytes> = rmp_serde::from_slice(bytes)
            .map_err(|_| Error::BadData("invalid msgpack version map"))?;
        let mut map = BTreeMap::new();
        for (key, value) in raw {
            map.insert(key, Versionstamp::from_bytes(&value.0)?);
        }
        Ok(VersionMap(map))
    }

    /// The dotted wire token handed to clients and recorded per destination.
    pub fn to_token(&self) -> String {
        self.0
            .iter()
            .map(|(key, version)| {
                format!("{key}{}", utils::base64_encode_url_safe(&version.to_bytes()))
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn from_token(token: &str) -> Result<Self> {
        let mut map = BTreeMap::new();
        for part in token.split('.').filter(|part| !part.is_empty()) {
            let (key, encoded) = part.split_at(1);
            let bytes = utils::base64_decode_url_safe(encoded)?;
            map.insert(key.to_owned(), Versionstamp::from_bytes(&bytes)?);
        }
        Ok(VersionMap(map))
    }
}

/// Byte-slice wrapper so msgpack encodes stamps as bin data, not arrays.
mod serde_bytes_compat {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub struct Bytes(pub Vec<u8>);

    impl Serialize for Bytes {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_bytes(&self.0)
        }
    }

    impl<'de> Deserialize<'de> for Bytes {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct Visitor;
            impl<'de> de::Visitor<'de> for Visitor {
                type Value = Bytes;

                fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str("bytes")
                }

                fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Bytes, E> {
                    Ok(Bytes(v.to_vec()))
                }

                fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Bytes, E> {
                    Ok(Bytes(v))
                }
            }
            deserializer.deserialize_byte_buf(Visitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(counter: u8) -> Versionstamp {
        Versionstamp::from_parts([0, 0, 0, 0, 0, 0, 0, 0, 0, counter], 0)
    }

    #[test]
    fn test_msgpack_round_trip() {
        let mut map = VersionMap::new();
        map.set(ROOMS_STREAM, stamp(9));
        map.set(ACCOUNTS_STREAM, stamp(4));

        let decoded = VersionMap::from_msgpack(&map.to_msgpack()).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(decoded.get(ROOMS_STREAM), Some(stamp(9)));
        assert_eq!(decoded.get(DEVICES_STREAM), None);
    }

    #[test]
    fn test_token_round_trip() {
        let mut map = VersionMap::new();
        map.set(ROOMS_STREAM, stamp(1));
        map.set(DEVICES_STREAM, stamp(2));

        let token = map.to_token();
        assert_eq!(token.split('.').count(), 2);
        assert!(token.starts_with('d') || token.contains(".d") || token.contains(".r"));

        let decoded = VersionMap::from_token(&token).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(VersionMap::from_token("").unwrap(), VersionMap::new());
    }
}
