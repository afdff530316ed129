//! Ordered key-value engine consumed by the store.
//!
//! The store only needs point reads and writes, ordered prefix scans and
//! atomic batches. [`MemoryDatastore`] is the in-process engine used by
//! tests and the demo binary.

use crate::key::Key;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors raised by a datastore backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("Datastore is read-only")]
    ReadOnly,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Corrupt entry at {key}: {reason}")]
    Corrupt { key: Key, reason: String },
}

/// One staged write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put(Key, Vec<u8>),
    Delete(Key),
}

/// Writes staged for atomic commit. Later ops on the same key win.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Batch::default()
    }

    pub fn put(&mut self, key: Key, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Key) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Move another batch's ops to the end of this one.
    pub fn append(&mut self, other: &mut Batch) {
        self.ops.append(&mut other.ops);
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered key-value engine.
pub trait Datastore: Send + Sync + 'static {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError>;

    fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError>;

    fn delete(&self, key: &Key) -> Result<(), DatastoreError>;

    /// Every entry equal to or below `prefix`, in key order.
    fn query(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>, DatastoreError>;

    /// Apply all ops of a batch atomically.
    fn commit(&self, batch: Batch) -> Result<(), DatastoreError>;

    /// Flush everything under `prefix` to durable storage.
    fn sync(&self, prefix: &Key) -> Result<(), DatastoreError>;
}

/// In-memory [`Datastore`] over a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<Key, Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        MemoryDatastore::default()
    }

    /// Make every write fail with [`DatastoreError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_writable(&self) -> Result<(), DatastoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            Err(DatastoreError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError> {
        self.check_writable()?;
        self.entries.write().insert(key.clone(), value);
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        self.check_writable()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn query(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>, DatastoreError> {
        // Keys sharing a string prefix but not the path prefix ("/ab" under
        // "/a") sort inside the range, so filter on path boundaries.
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.as_str().starts_with(prefix.as_str()))
            .filter(|(k, _)| k.has_prefix(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: Batch) -> Result<(), DatastoreError> {
        self.check_writable()?;
        let mut entries = self.entries.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn sync(&self, _prefix: &Key) -> Result<(), DatastoreError> {
        Ok(())
    }
}
