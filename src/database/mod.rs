// =============================================================================
// Parlor - Database Layer
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Engine handle plus the key-space primitives shared by every directory:
//   order-preserving subspace key packing and versionstamp-suffixed ranges.
//
// =============================================================================

pub mod abstraction;
pub mod versionstamp;

use std::sync::Arc;

pub use abstraction::{
    memory::MemoryEngine, KeyRange, KeyValue, KvsEngine, KvsTransaction, KvsWriteTransaction,
    RangeOptions,
};
pub use versionstamp::{Versionstamp, VERSIONSTAMP_LEN};

use crate::{Config, Result};

/// Handle to the key-value store carrying the transaction tuning from the
/// configuration. All room subsystem components go through this.
#[derive(Clone)]
pub struct Database {
    engine: Arc<dyn KvsEngine>,
    pub transaction_timeout_ms: u64,
    pub transaction_retry_limit: u32,
}

impl Database {
    pub fn new(engine: Arc<dyn KvsEngine>, config: &Config) -> Self {
        Database {
            engine,
            transaction_timeout_ms: config.transaction_timeout_ms,
            transaction_retry_limit: config.transaction_retry_limit,
        }
    }

    /// Engine handle with default tuning, for tests and tools.
    pub fn with_default_tuning(engine: Arc<dyn KvsEngine>) -> Self {
        Database {
            engine,
            transaction_timeout_ms: 5_000,
            transaction_retry_limit: 10,
        }
    }

    pub async fn read(&self) -> Result<Box<dyn KvsTransaction>> {
        self.engine.read_transaction().await
    }

    pub async fn write(&self) -> Result<Box<dyn KvsWriteTransaction>> {
        self.engine.write_transaction().await
    }
}

/// An order-preserving key namespace.
///
/// Keys pack as `prefix | part ... 0x00 | part ... 0x00 | ...` with embedded
/// zero bytes escaped as `0x00 0xff`; the terminator after each part gives
/// prefix isolation, so the range over `(a)` never captures keys under
/// `(ab)`. Versionstamps are appended raw as the final 12 bytes of a key
/// (never escaped or terminated) so stamp order is key order and the engine
/// can patch incomplete stamps in place.
#[derive(Debug, Clone)]
pub struct Subspace {
    prefix: Vec<u8>,
}

const PART_TERMINATOR: u8 = 0x00;
const ESCAPED_ZERO: [u8; 2] = [0x00, 0xff];

impl Subspace {
    pub fn new(tag: &[u8]) -> Self {
        let mut prefix = tag.to_vec();
        prefix.push(PART_TERMINATOR);
        Subspace { prefix }
    }

    /// A nested subspace, e.g. `ev` -> `ev/id`.
    pub fn sub(&self, tag: &[u8]) -> Subspace {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(tag);
        prefix.push(PART_TERMINATOR);
        Subspace { prefix }
    }

    /// Pack a key from string-like parts.
    pub fn key(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        for part in parts {
            for &byte in *part {
                if byte == 0x00 {
                    key.extend_from_slice(&ESCAPED_ZERO);
                } else {
                    key.push(byte);
                }
            }
            key.push(PART_TERMINATOR);
        }
        key
    }

    /// Pack a key whose final component is a versionstamp.
    pub fn versioned_key(&self, parts: &[&[u8]], version: Versionstamp) -> Vec<u8> {
        let mut key = self.key(parts);
        key.extend_from_slice(&version.to_bytes());
        key
    }

    /// The range covering every key nested under `parts`.
    pub fn range(&self, parts: &[&[u8]]) -> KeyRange {
        let base = self.key(parts);
        let mut begin = base.clone();
        begin.push(0x00);
        let mut end = base;
        end.push(0xff);
        KeyRange { begin, end }
    }

    /// The range over versionstamp-suffixed keys under `parts`.
    ///
    /// `from` is inclusive and `to` exclusive, per KVS convention; the zero
    /// stamp means "unbounded" on either side. Callers wanting events
    /// *after* a position bump its user version before passing it as `from`.
    pub fn version_range(&self, parts: &[&[u8]], from: Versionstamp, to: Versionstamp) -> KeyRange {
        let base = self.key(parts);
        let begin = if from.is_zero() {
            base.clone()
        } else {
            let mut begin = base.clone();
            begin.extend_from_slice(&from.to_bytes());
            begin
        };
        let end = if to.is_zero() {
            let mut end = base;
            end.extend_from_slice(&[0xff; VERSIONSTAMP_LEN + 1]);
            end
        } else {
            let mut end = base;
            end.extend_from_slice(&to.to_bytes());
            end
        };
        KeyRange { begin, end }
    }

    /// Strip this subspace's prefix from a key.
    pub fn strip<'a>(&self, key: &'a [u8]) -> Result<&'a [u8]> {
        key.strip_prefix(self.prefix.as_slice())
            .ok_or(crate::Error::BadData("key is not in subspace"))
    }

    /// Unpack the string parts of a key packed by [`Subspace::key`]. If
    /// `trailing_version` is set the final 12 bytes are decoded as a
    /// versionstamp.
    pub fn unpack(
        &self,
        key: &[u8],
        trailing_version: bool,
    ) -> Result<(Vec<Vec<u8>>, Option<Versionstamp>)> {
        let mut rest = self.strip(key)?;

        let version = if trailing_version {
            if rest.len() < VERSIONSTAMP_LEN {
                return Err(crate::Error::BadData("key too short for versionstamp"));
            }
            let (parts, stamp) = rest.split_at(rest.len() - VERSIONSTAMP_LEN);
            rest = parts;
            Some(Versionstamp::from_bytes(stamp)?)
        } else {
            None
        };

        let mut parts = Vec::new();
        let mut current = Vec::new();
        let mut bytes = rest.iter().copied().peekable();
        while let Some(byte) = bytes.next() {
            if byte == 0x00 {
                if bytes.peek() == Some(&0xff) {
                    bytes.next();
                    current.push(0x00);
                } else {
                    parts.push(std::mem::take(&mut current));
                }
            } else {
                current.push(byte);
            }
        }
        if !current.is_empty() {
            return Err(crate::Error::BadData("unterminated key part"));
        }

        Ok((parts, version))
    }
}

/// Decode a packed key part as UTF-8.
pub fn part_to_string(part: Vec<u8>) -> Result<String> {
    String::from_utf8(part).map_err(|_| crate::Error::BadData("key part is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_isolation() {
        let space = Subspace::new(b"ev").sub(b"rmv");
        let room_range = space.range(&[b"!room:x"]);
        let sibling = space.key(&[b"!room:xy", b"$ev"]);

        assert!(sibling < room_range.begin || sibling >= room_range.end);

        let child = space.key(&[b"!room:x", b"$ev"]);
        assert!(child >= room_range.begin && child < room_range.end);
    }

    #[test]
    fn test_embedded_zero_escaping() {
        let space = Subspace::new(b"t");
        let key = space.key(&[b"a\x00b", b"c"]);
        let (parts, version) = space.unpack(&key, false).unwrap();
        assert_eq!(parts, vec![b"a\x00b".to_vec(), b"c".to_vec()]);
        assert!(version.is_none());
    }

    #[test]
    fn test_version_range_bounds() {
        let space = Subspace::new(b"ev").sub(b"ver");
        let first = Versionstamp::from_parts([0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 0);
        let second = Versionstamp::from_parts([0, 0, 0, 0, 0, 0, 0, 0, 0, 2], 0);

        let key_first = space.versioned_key(&[], first);
        let key_second = space.versioned_key(&[], second);

        // Unbounded range covers both
        let all = space.version_range(&[], Versionstamp::ZERO, Versionstamp::ZERO);
        assert!(key_first >= all.begin && key_first < all.end);
        assert!(key_second >= all.begin && key_second < all.end);

        // From is inclusive, to is exclusive
        let from_second = space.version_range(&[], second, Versionstamp::ZERO);
        assert!(key_first < from_second.begin);
        assert!(key_second >= from_second.begin);

        let to_second = space.version_range(&[], Versionstamp::ZERO, second);
        assert!(key_first < to_second.end);
        assert!(key_second >= to_second.end);

        // Bumping the user version makes an inclusive position exclusive
        let after_first = space.version_range(&[], first.next(), Versionstamp::ZERO);
        assert!(key_first < after_first.begin);
        assert!(key_second >= after_first.begin);
    }

    #[test]
    fn test_unpack_versioned_key() {
        let space = Subspace::new(b"ev").sub(b"rmv");
        let stamp = Versionstamp::from_parts([0, 0, 0, 0, 0, 0, 0, 0, 1, 7], 3);
        let key = space.versioned_key(&[b"!room:x"], stamp);

        let (parts, version) = space.unpack(&key, true).unwrap();
        assert_eq!(parts, vec![b"!room:x".to_vec()]);
        assert_eq!(version, Some(stamp));
    }
}
