//! Backing key-value storage
//!
//! The tree persists nodes, orphan records and root pointers through the
//! [`KvStore`] trait. Every commit is handed to the store as one
//! [`WriteBatch`], which implementations must apply atomically: after a
//! crash either all of a batch is visible or none of it is.

mod file_db;
mod mem_db;

pub use file_db::FileDb;
pub use mem_db::MemDb;

use crate::model::keys::prefix_end;
use crate::Result;
use serde::{Deserialize, Serialize};

/// A single write inside a batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered group of writes applied atomically
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
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

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered byte-string key-value storage consumed by the node database
pub trait KvStore: Send + Sync {
    /// Get the value stored under `key`
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Check whether `key` is present
    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Store a single key
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value.to_vec());
        self.write(batch)
    }

    /// Delete a single key
    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key.to_vec());
        self.write(batch)
    }

    /// All entries with `start <= key < end` in ascending key order.
    /// `end = None` scans to the end of the keyspace.
    fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation of `batch` atomically, in order
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// All entries whose key starts with `prefix`
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let end = prefix_end(prefix);
        self.scan(prefix, end.as_deref())
    }

    /// Make previously written batches durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
