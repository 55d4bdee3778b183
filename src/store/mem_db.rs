//! In-memory ordered key-value store

use super::{BatchOp, KvStore, WriteBatch};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A [`KvStore`] backed by a `BTreeMap`; batches are applied under one write lock
#[derive(Default)]
pub struct MemDb {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        MemDb::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub(crate) fn apply_batch(entries: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: WriteBatch) {
    for op in batch.into_ops() {
        match op {
            BatchOp::Put { key, value } => {
                entries.insert(key, value);
            }
            BatchOp::Delete { key } => {
                entries.remove(&key);
            }
        }
    }
}

pub(crate) fn scan_map(
    entries: &BTreeMap<Vec<u8>, Vec<u8>>,
    start: &[u8],
    end: Option<&[u8]>,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    if let Some(end) = end {
        if end <= start {
            return Vec::new();
        }
    }
    let upper = match end {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    entries
        .range::<[u8], _>((Bound::Included(start), upper))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl KvStore for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_map(&self.entries.read(), start, end))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        apply_batch(&mut self.entries.write(), batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let db = MemDb::new();
        db.set(b"a", b"1").unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(db.has(b"a").unwrap());

        db.delete(b"a").unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
        assert!(db.is_empty());
    }

    #[test]
    fn test_scan_is_ordered_and_half_open() {
        let db = MemDb::new();
        for key in [b"d", b"a", b"c", b"b"] {
            db.set(key, b"").unwrap();
        }
        let keys: Vec<_> = db
            .scan(b"b", Some(b"d"))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(db.scan(b"c", None).unwrap().len(), 2);
        assert!(db.scan(b"d", Some(b"a")).unwrap().is_empty());
    }

    #[test]
    fn test_batch_applies_in_order() {
        let db = MemDb::new();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"1".to_vec());
        batch.delete(b"k".to_vec());
        batch.put(b"j".to_vec(), b"2".to_vec());
        db.write(batch).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
        assert_eq!(db.get(b"j").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_scan_prefix() {
        let db = MemDb::new();
        db.set(b"oa", b"").unwrap();
        db.set(b"ob", b"").unwrap();
        db.set(b"p", b"").unwrap();
        assert_eq!(db.scan_prefix(b"o").unwrap().len(), 2);
    }
}
