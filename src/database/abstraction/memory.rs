//! In-memory KVS engine.
//!
//! Deterministic, single-process implementation used by the test suites.
//! Transactions snapshot the committed state at open; write transactions
//! buffer mutations and apply them atomically at commit under a global
//! commit counter that yields the versionstamp. The engine performs no
//! conflict detection - production deployments sit on a store that provides
//! serializable transactions natively.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use async_trait::async_trait;

use super::{KeyRange, KeyValue, KvsEngine, KvsTransaction, KvsWriteTransaction, RangeOptions};
use crate::database::versionstamp::{Versionstamp, TX_VERSION_LEN, VERSIONSTAMP_LEN};
use crate::Result;

#[derive(Default)]
pub struct MemoryEngine {
    store: Arc<Store>,
}

#[derive(Default)]
struct Store {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    commit_counter: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.store.data.read().expect("store lock poisoned").clone()
    }
}

#[async_trait]
impl KvsEngine for MemoryEngine {
    async fn read_transaction(&self) -> Result<Box<dyn KvsTransaction>> {
        Ok(Box::new(MemoryReadTransaction {
            snapshot: self.snapshot(),
        }))
    }

    async fn write_transaction(&self) -> Result<Box<dyn KvsWriteTransaction>> {
        Ok(Box::new(MemoryWriteTransaction {
            store: Arc::clone(&self.store),
            snapshot: self.snapshot(),
            buffer: Mutex::new(Vec::new()),
        }))
    }
}

fn range_read(
    snapshot: &BTreeMap<Vec<u8>, Vec<u8>>,
    range: &KeyRange,
    options: RangeOptions,
) -> Vec<KeyValue> {
    let iter = snapshot.range::<[u8], _>((
        Bound::Included(range.begin.as_slice()),
        Bound::Excluded(range.end.as_slice()),
    ));
    let kvs: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = if options.reverse {
        Box::new(iter.rev())
    } else {
        Box::new(iter)
    };
    let limit = options.limit.unwrap_or(usize::MAX);
    kvs.take(limit)
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

struct MemoryReadTransaction {
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[async_trait]
impl KvsTransaction for MemoryReadTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key).cloned())
    }

    async fn get_range(&self, range: &KeyRange, options: RangeOptions) -> Result<Vec<KeyValue>> {
        Ok(range_read(&self.snapshot, range, options))
    }
}

enum Mutation {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    ClearRange(KeyRange),
    SetVersionstampedKey(Vec<u8>, Vec<u8>),
    SetVersionstampedValue(Vec<u8>, Vec<u8>),
}

struct MemoryWriteTransaction {
    store: Arc<Store>,
    // Snapshot with this transaction's own plain mutations applied, so
    // reads observe earlier writes of the same batch.
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
    buffer: Mutex<Vec<Mutation>>,
}

impl MemoryWriteTransaction {
    fn buffered_view(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut view = self.snapshot.clone();
        for mutation in self.buffer.lock().expect("buffer lock poisoned").iter() {
            match mutation {
                Mutation::Set(key, value) => {
                    view.insert(key.clone(), value.clone());
                }
                Mutation::Clear(key) => {
                    view.remove(key);
                }
                Mutation::ClearRange(range) => {
                    let doomed: Vec<Vec<u8>> = view
                        .range::<[u8], _>((
                            Bound::Included(range.begin.as_slice()),
                            Bound::Excluded(range.end.as_slice()),
                        ))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in doomed {
                        view.remove(&key);
                    }
                }
                // Incomplete-stamped keys are not visible until commit; the
                // stamped value is visible under its (plain) key.
                Mutation::SetVersionstampedKey(_, _) => {}
                Mutation::SetVersionstampedValue(key, value) => {
                    view.insert(key.clone(), value.clone());
                }
            }
        }
        view
    }

    fn push(&self, mutation: Mutation) {
        self.buffer
            .lock()
            .expect("buffer lock poisoned")
            .push(mutation);
    }
}

fn patch_key(mut key: Vec<u8>, tx: &[u8; TX_VERSION_LEN]) -> Vec<u8> {
    let len = key.len();
    assert!(
        len >= VERSIONSTAMP_LEN && key[len - VERSIONSTAMP_LEN..len - 2] == [0xff; TX_VERSION_LEN],
        "versionstamped key does not end with an incomplete stamp"
    );
    key[len - VERSIONSTAMP_LEN..len - 2].copy_from_slice(tx);
    key
}

fn patch_value(mut value: Vec<u8>, tx: &[u8; TX_VERSION_LEN]) -> Vec<u8> {
    assert!(
        value.len() >= VERSIONSTAMP_LEN && value[..TX_VERSION_LEN] == [0xff; TX_VERSION_LEN],
        "versionstamped value does not begin with an incomplete stamp"
    );
    value[..TX_VERSION_LEN].copy_from_slice(tx);
    value
}

#[async_trait]
impl KvsTransaction for MemoryWriteTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.buffered_view().get(key).cloned())
    }

    async fn get_range(&self, range: &KeyRange, options: RangeOptions) -> Result<Vec<KeyValue>> {
        Ok(range_read(&self.buffered_view(), range, options))
    }
}

#[async_trait]
impl KvsWriteTransaction for MemoryWriteTransaction {
    fn set(&self, key: &[u8], value: &[u8]) {
        self.push(Mutation::Set(key.to_vec(), value.to_vec()));
    }

    fn clear(&self, key: &[u8]) {
        self.push(Mutation::Clear(key.to_vec()));
    }

    fn clear_range(&self, range: &KeyRange) {
        self.push(Mutation::ClearRange(range.clone()));
    }

    fn set_versionstamped_key(&self, key: &[u8], value: &[u8]) {
        self.push(Mutation::SetVersionstampedKey(key.to_vec(), value.to_vec()));
    }

    fn set_versionstamped_value(&self, key: &[u8], value: &[u8]) {
        self.push(Mutation::SetVersionstampedValue(key.to_vec(), value.to_vec()));
    }

    async fn commit(self: Box<Self>) -> Result<Versionstamp> {
        let counter = self.store.commit_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tx = [0u8; TX_VERSION_LEN];
        tx[2..].copy_from_slice(&counter.to_be_bytes());

        let mut data = self.store.data.write().expect("store lock poisoned");
        for mutation in self.buffer.into_inner().expect("buffer lock poisoned") {
            match mutation {
                Mutation::Set(key, value) => {
                    data.insert(key, value);
                }
                Mutation::Clear(key) => {
                    data.remove(&key);
                }
                Mutation::ClearRange(range) => {
                    let doomed: Vec<Vec<u8>> = data
                        .range::<[u8], _>((
                            Bound::Included(range.begin.as_slice()),
                            Bound::Excluded(range.end.as_slice()),
                        ))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in doomed {
                        data.remove(&key);
                    }
                }
                Mutation::SetVersionstampedKey(key, value) => {
                    data.insert(patch_key(key, &tx), value);
                }
                Mutation::SetVersionstampedValue(key, value) => {
                    data.insert(key, patch_value(value, &tx));
                }
            }
        }

        Ok(Versionstamp::from_parts(tx, 0))
    }

    fn as_read(&self) -> &dyn KvsTransaction {
        self
    }
}
