// =============================================================================
// Parlor - Key-Value Store Abstraction
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Object-safe traits over the ordered, transactional, globally-versioned
//   key-value store the room subsystem persists into. Deployments provide an
//   engine; the in-memory engine backs the test suites.
//
// =============================================================================

use async_trait::async_trait;

use super::versionstamp::Versionstamp;
use crate::Result;

pub mod memory;

/// A key-value pair returned from a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A half-open key range: `begin` inclusive, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl RangeOptions {
    pub fn limit(limit: usize) -> Self {
        RangeOptions {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn reverse_limit(limit: usize) -> Self {
        RangeOptions {
            limit: Some(limit),
            reverse: true,
        }
    }
}

/// Opens transactions against the store.
#[async_trait]
pub trait KvsEngine: Send + Sync {
    async fn read_transaction(&self) -> Result<Box<dyn KvsTransaction>>;
    async fn write_transaction(&self) -> Result<Box<dyn KvsWriteTransaction>>;
}

/// Read operations available in every transaction. A transaction is a
/// consistent snapshot; it is owned by exactly one task.
#[async_trait]
pub trait KvsTransaction: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn get_range(&self, range: &KeyRange, options: RangeOptions) -> Result<Vec<KeyValue>>;
}

/// Write operations. Mutations buffer locally and apply atomically at
/// commit; reads observe the transaction's own writes.
///
/// Versionstamped mutations carry an incomplete [`Versionstamp`] that the
/// engine fills in with the commit's transaction version:
/// `set_versionstamped_key` expects it as the final 12 bytes of the key,
/// `set_versionstamped_value` as the first 12 bytes of the value. Every
/// subspace in the data model places stamps accordingly.
#[async_trait]
pub trait KvsWriteTransaction: KvsTransaction {
    fn set(&self, key: &[u8], value: &[u8]);

    fn clear(&self, key: &[u8]);

    fn clear_range(&self, range: &KeyRange);

    fn set_versionstamped_key(&self, key: &[u8], value: &[u8]);

    fn set_versionstamped_value(&self, key: &[u8], value: &[u8]);

    /// Commit the buffered mutations, returning the assigned versionstamp
    /// (user version zero).
    async fn commit(self: Box<Self>) -> Result<Versionstamp>;

    /// The read view of this transaction, for code paths shared with
    /// read-only transactions.
    fn as_read(&self) -> &dyn KvsTransaction;
}
