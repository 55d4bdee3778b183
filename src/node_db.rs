//! Node persistence, orphan bookkeeping and pruning
//!
//! Nodes are stored content-addressed under their hash. When a commit
//! replaces a node, an orphan record `(from, to, hash)` remembers that the
//! node was live in versions `[from, to)`. Pruning a version walks only the
//! orphan records superseded right after it, so its cost is proportional to
//! what that version changed rather than to the size of the tree.

use crate::model::keys::{self, Orphan};
use crate::model::{FastNode, Hash, Node};
use crate::store::{KvStore, WriteBatch};
use crate::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, trace};

/// The node database: typed access to nodes, orphans and root pointers
/// on top of a [`KvStore`]
pub struct NodeDb {
    db: Arc<dyn KvStore>,
    /// Decoded nodes by hash; `None` when caching is disabled
    cache: Option<Mutex<LruCache<Hash, Arc<Node>>>>,
    /// Open snapshot count per version
    readers: Mutex<HashMap<u64, usize>>,
}

impl NodeDb {
    /// Wrap a store; `cache_size = 0` disables the node cache
    pub fn new(db: Arc<dyn KvStore>, cache_size: usize) -> Self {
        NodeDb {
            db,
            cache: NonZeroUsize::new(cache_size).map(|cap| Mutex::new(LruCache::new(cap))),
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying key-value store
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.db
    }

    // === Nodes ===

    /// Fetch a node by hash. A missing node is an error: every hash handed
    /// out by a live tree must resolve.
    pub fn get_node(&self, hash: &Hash) -> Result<Arc<Node>> {
        if let Some(cache) = &self.cache {
            if let Some(node) = cache.lock().get(hash) {
                return Ok(node.clone());
            }
        }

        trace!(hash = %hash.short(), "node cache miss");
        let bytes = self
            .db
            .get(&keys::node_key(hash))?
            .ok_or(Error::NodeNotFound(*hash))?;
        let node = Arc::new(Node::decode(hash, &bytes)?);

        if let Some(cache) = &self.cache {
            cache.lock().put(*hash, node.clone());
        }
        Ok(node)
    }

    pub fn has_node(&self, hash: &Hash) -> Result<bool> {
        self.db.has(&keys::node_key(hash))
    }

    /// Queue a node write. Writing an existing hash again stores identical bytes.
    pub fn save_node(&self, batch: &mut WriteBatch, node: &Node) -> Result<()> {
        batch.put(keys::node_key(&node.hash()), node.encode()?);
        Ok(())
    }

    /// Queue an orphan record
    pub fn save_orphan(&self, batch: &mut WriteBatch, orphan: &Orphan) {
        batch.put(keys::orphan_key(orphan), Vec::new());
    }

    /// Queue the root pointer of `version`; `None` records an empty tree
    pub fn save_root(&self, batch: &mut WriteBatch, version: u64, root: Option<Hash>) {
        let value = root.map(|h| h.as_bytes().to_vec()).unwrap_or_default();
        batch.put(keys::root_key(version), value);
    }

    /// Write a batch atomically and warm the cache with the nodes it created
    pub fn commit(&self, batch: WriteBatch, new_nodes: &[Arc<Node>]) -> Result<()> {
        self.db.write(batch)?;
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            for node in new_nodes {
                cache.put(node.hash(), node.clone());
            }
        }
        Ok(())
    }

    fn evict(&self, hashes: &[Hash]) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            for hash in hashes {
                cache.pop(hash);
            }
        }
    }

    // === Versions ===

    /// The root hash committed at `version`; `Ok(None)` for an empty tree
    pub fn get_root(&self, version: u64) -> Result<Option<Hash>> {
        let value = self
            .db
            .get(&keys::root_key(version))?
            .ok_or(Error::VersionNotFound(version))?;
        if value.is_empty() {
            return Ok(None);
        }
        Hash::from_slice(&value)
            .map(Some)
            .ok_or_else(|| Error::Corruption(format!("root pointer of version {} is malformed", version)))
    }

    pub fn version_exists(&self, version: u64) -> Result<bool> {
        self.db.has(&keys::root_key(version))
    }

    /// Every committed version, ascending
    pub fn versions(&self) -> Result<Vec<u64>> {
        self.db
            .scan_prefix(&[keys::ROOT_PREFIX])?
            .into_iter()
            .map(|(key, _)| {
                keys::parse_root_key(&key)
                    .ok_or_else(|| Error::Corruption("malformed root pointer key".into()))
            })
            .collect()
    }

    pub fn latest_version(&self) -> Result<Option<u64>> {
        Ok(self.versions()?.last().copied())
    }

    // === Orphans ===

    /// Orphans superseded exactly at `to_version`
    pub fn orphans_at(&self, to_version: u64) -> Result<Vec<Orphan>> {
        self.parse_orphans(self.db.scan_prefix(&keys::orphan_prefix(to_version))?)
    }

    /// Every orphan record, ordered by superseding version
    pub fn orphans(&self) -> Result<Vec<Orphan>> {
        self.parse_orphans(self.db.scan_prefix(&[keys::ORPHAN_PREFIX])?)
    }

    /// Orphans superseded at `to_version` or later
    fn orphans_from(&self, to_version: u64) -> Result<Vec<Orphan>> {
        let end = keys::prefix_end(&[keys::ORPHAN_PREFIX]);
        let entries = self
            .db
            .scan(&keys::orphan_prefix(to_version), end.as_deref())?;
        self.parse_orphans(entries)
    }

    fn parse_orphans(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<Orphan>> {
        entries
            .into_iter()
            .map(|(key, _)| {
                keys::parse_orphan_key(&key)
                    .ok_or_else(|| Error::Corruption("malformed orphan key".into()))
            })
            .collect()
    }

    /// Drop orphan records that point past the latest committed version.
    /// They can only come from a commit whose root pointer never landed.
    pub fn discard_incomplete(&self, latest: Option<u64>) -> Result<usize> {
        let stale = self.orphans_from(latest.map_or(0, |v| v + 1))?;
        if stale.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for orphan in &stale {
            batch.delete(keys::orphan_key(orphan));
        }
        self.db.write(batch)?;
        debug!(count = stale.len(), "discarded orphan records of an incomplete commit");
        Ok(stale.len())
    }

    // === Fast index ===

    /// Fast node of `key` in the version the fast index describes
    pub fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>> {
        self.db
            .get(&keys::fast_key(key))?
            .map(|bytes| FastNode::decode(key, &bytes))
            .transpose()
    }

    pub fn save_fast_node(&self, batch: &mut WriteBatch, key: &[u8], node: &FastNode) -> Result<()> {
        batch.put(keys::fast_key(key), node.encode()?);
        Ok(())
    }

    pub fn delete_fast_node(&self, batch: &mut WriteBatch, key: &[u8]) {
        batch.delete(keys::fast_key(key));
    }

    /// Fast nodes with `start <= key < end`, ascending
    pub fn fast_nodes(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, FastNode)>> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Ok(Vec::new());
            }
        }
        let lower = keys::fast_key(start.unwrap_or_default());
        let upper = match end {
            Some(end) => Some(keys::fast_key(end)),
            None => keys::prefix_end(&[keys::FAST_PREFIX]),
        };
        self.db
            .scan(&lower, upper.as_deref())?
            .into_iter()
            .map(|(stored, bytes)| {
                let key = keys::parse_fast_key(&stored)
                    .ok_or_else(|| Error::Corruption("malformed fast node key".into()))?;
                let node = FastNode::decode(key, &bytes)?;
                Ok((key.to_vec(), node))
            })
            .collect()
    }

    /// Version the fast index describes; `None` for a store without versions
    pub fn fast_version(&self) -> Result<Option<u64>> {
        let Some(bytes) = self.db.get(keys::FAST_VERSION_KEY)? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Corruption("malformed fast index version".into()))?;
        Ok(Some(u64::from_be_bytes(bytes)))
    }

    /// Queue the fast index version marker
    pub fn save_fast_version(&self, batch: &mut WriteBatch, version: Option<u64>) {
        match version {
            Some(version) => batch.put(keys::FAST_VERSION_KEY.to_vec(), version.to_be_bytes().to_vec()),
            None => batch.delete(keys::FAST_VERSION_KEY.to_vec()),
        }
    }

    /// Queue deletion of every fast node
    pub fn clear_fast_nodes(&self, batch: &mut WriteBatch) -> Result<usize> {
        let stale = self.db.scan_prefix(&[keys::FAST_PREFIX])?;
        let count = stale.len();
        for (key, _) in stale {
            batch.delete(key);
        }
        Ok(count)
    }

    /// Drop every node, orphan and fast record of a store that holds no
    /// version, such as the nodes flushed by an abandoned import
    pub fn discard_unversioned(&self) -> Result<usize> {
        if self.latest_version()?.is_some() {
            return Err(Error::InvalidOperation(
                "store holds committed versions".into(),
            ));
        }
        let mut batch = WriteBatch::new();
        for prefix in [keys::NODE_PREFIX, keys::ORPHAN_PREFIX, keys::FAST_PREFIX] {
            for (key, _) in self.db.scan_prefix(&[prefix])? {
                batch.delete(key);
            }
        }
        if self.db.has(keys::FAST_VERSION_KEY)? {
            batch.delete(keys::FAST_VERSION_KEY.to_vec());
        }
        let count = batch.len();
        if count == 0 {
            return Ok(0);
        }
        self.db.write(batch)?;
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        debug!(count, "discarded records without a version");
        Ok(count)
    }

    // === Pruning ===

    /// Delete `version`: its root pointer, plus every node that no retained
    /// version can reach any more. Rejected for the latest version and for
    /// versions with open snapshots.
    pub fn delete_version(&self, version: u64) -> Result<()> {
        let versions = self.versions()?;
        if !versions.contains(&version) {
            return Err(Error::VersionNotFound(version));
        }
        if versions.last() == Some(&version) {
            return Err(Error::InvalidOperation(format!(
                "cannot delete latest version {}",
                version
            )));
        }
        let readers = self.reader_count(version);
        if readers > 0 {
            return Err(Error::InvalidOperation(format!(
                "version {} has {} active readers",
                version, readers
            )));
        }

        let predecessor = versions.iter().rev().find(|v| **v < version).copied();

        let mut batch = WriteBatch::new();
        let mut deleted = Vec::new();
        let mut moved = 0usize;
        // Nodes whose last live version is `version`
        for orphan in self.orphans_at(version + 1)? {
            batch.delete(keys::orphan_key(&orphan));
            match predecessor {
                Some(prev) if prev >= orphan.from_version => {
                    // Still reachable from `prev`; shorten its interval
                    self.save_orphan(
                        &mut batch,
                        &Orphan {
                            to_version: prev + 1,
                            ..orphan
                        },
                    );
                    moved += 1;
                }
                _ => {
                    batch.delete(keys::node_key(&orphan.hash));
                    deleted.push(orphan.hash);
                }
            }
        }
        batch.delete(keys::root_key(version));

        self.db.write(batch)?;
        self.evict(&deleted);
        debug!(version, deleted = deleted.len(), moved, "deleted version");
        Ok(())
    }

    /// Delete every version `>= from_version` and every node created in
    /// them, making `from_version - 1` the latest version again.
    pub fn delete_versions_from(&self, from_version: u64) -> Result<()> {
        let doomed: Vec<u64> = self
            .versions()?
            .into_iter()
            .filter(|v| *v >= from_version)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        if let Some(v) = doomed.iter().find(|v| self.reader_count(**v) > 0) {
            return Err(Error::InvalidOperation(format!(
                "version {} has active readers",
                v
            )));
        }

        let mut batch = WriteBatch::new();
        let mut deleted = Vec::new();
        for (key, bytes) in self.db.scan_prefix(&[keys::NODE_PREFIX])? {
            let hash = keys::parse_node_key(&key)
                .ok_or_else(|| Error::Corruption("malformed node key".into()))?;
            let node = Node::decode(&hash, &bytes)?;
            if node.version() >= from_version {
                batch.delete(key);
                deleted.push(hash);
            }
        }
        // Nodes superseded after the new latest version are live again
        for orphan in self.orphans_from(from_version)? {
            batch.delete(keys::orphan_key(&orphan));
        }
        for version in &doomed {
            batch.delete(keys::root_key(*version));
        }

        self.db.write(batch)?;
        self.evict(&deleted);
        debug!(from_version, versions = doomed.len(), nodes = deleted.len(), "deleted versions");
        Ok(())
    }

    // === Readers ===

    pub(crate) fn acquire_reader(&self, version: u64) {
        *self.readers.lock().entry(version).or_insert(0) += 1;
    }

    pub(crate) fn release_reader(&self, version: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&version);
            }
        }
    }

    /// Number of open snapshots of `version`
    pub fn reader_count(&self, version: u64) -> usize {
        self.readers.lock().get(&version).copied().unwrap_or(0)
    }

    // === Introspection ===

    /// Number of stored nodes
    pub fn node_count(&self) -> Result<usize> {
        Ok(self.db.scan_prefix(&[keys::NODE_PREFIX])?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDb;

    fn ndb(cache_size: usize) -> NodeDb {
        NodeDb::new(Arc::new(MemDb::new()), cache_size)
    }

    fn commit_leaf(ndb: &NodeDb, node: &Node, version: u64) {
        let mut batch = WriteBatch::new();
        ndb.save_node(&mut batch, node).unwrap();
        ndb.save_root(&mut batch, version, Some(node.hash()));
        ndb.commit(batch, &[]).unwrap();
    }

    #[test]
    fn test_get_node_roundtrip_with_and_without_cache() {
        for cache_size in [0, 16] {
            let ndb = ndb(cache_size);
            let leaf = Node::leaf(b"k".to_vec(), b"v".to_vec(), 1);
            commit_leaf(&ndb, &leaf, 1);

            let loaded = ndb.get_node(&leaf.hash()).unwrap();
            assert_eq!(*loaded, leaf);
            // second read is served by the cache when enabled
            assert_eq!(*ndb.get_node(&leaf.hash()).unwrap(), leaf);
        }
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let ndb = ndb(4);
        let err = ndb.get_node(&Hash::digest(b"nothing")).unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[test]
    fn test_tampered_node_is_corruption() {
        let ndb = ndb(0);
        let leaf = Node::leaf(b"k".to_vec(), b"v".to_vec(), 1);
        let other = Node::leaf(b"k".to_vec(), b"w".to_vec(), 1);
        ndb.store()
            .set(&keys::node_key(&leaf.hash()), &other.encode().unwrap())
            .unwrap();
        assert!(matches!(
            ndb.get_node(&leaf.hash()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_root_pointers() {
        let ndb = ndb(0);
        let mut batch = WriteBatch::new();
        ndb.save_root(&mut batch, 1, None);
        ndb.save_root(&mut batch, 2, Some(Hash::digest(b"root")));
        ndb.commit(batch, &[]).unwrap();

        assert_eq!(ndb.versions().unwrap(), vec![1, 2]);
        assert_eq!(ndb.latest_version().unwrap(), Some(2));
        assert_eq!(ndb.get_root(1).unwrap(), None);
        assert_eq!(ndb.get_root(2).unwrap(), Some(Hash::digest(b"root")));
        assert!(matches!(ndb.get_root(3), Err(Error::VersionNotFound(3))));
    }

    #[test]
    fn test_orphans_at_selects_one_version() {
        let ndb = ndb(0);
        let mut batch = WriteBatch::new();
        for (from, to) in [(1, 2), (1, 3), (2, 3), (3, 4)] {
            ndb.save_orphan(
                &mut batch,
                &Orphan {
                    from_version: from,
                    to_version: to,
                    hash: Hash::digest(&[from as u8, to as u8]),
                },
            );
        }
        ndb.commit(batch, &[]).unwrap();

        let at3 = ndb.orphans_at(3).unwrap();
        assert_eq!(at3.len(), 2);
        assert!(at3.iter().all(|o| o.to_version == 3));
        assert_eq!(ndb.orphans().unwrap().len(), 4);
        assert_eq!(ndb.orphans_from(3).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_version_moves_or_deletes_orphans() {
        let ndb = ndb(8);
        let shared = Node::leaf(b"a".to_vec(), b"1".to_vec(), 1);
        let short_lived = Node::leaf(b"b".to_vec(), b"2".to_vec(), 2);

        let mut batch = WriteBatch::new();
        ndb.save_node(&mut batch, &shared).unwrap();
        ndb.save_node(&mut batch, &short_lived).unwrap();
        for v in 1..=3 {
            ndb.save_root(&mut batch, v, Some(Hash::digest(&[v as u8])));
        }
        // `shared` was live in 1 and 2, `short_lived` only in 2
        for node in [&shared, &short_lived] {
            ndb.save_orphan(
                &mut batch,
                &Orphan {
                    from_version: node.version(),
                    to_version: 3,
                    hash: node.hash(),
                },
            );
        }
        ndb.commit(batch, &[]).unwrap();

        ndb.delete_version(2).unwrap();
        assert!(ndb.has_node(&shared.hash()).unwrap());
        assert!(!ndb.has_node(&short_lived.hash()).unwrap());
        assert_eq!(
            ndb.orphans().unwrap(),
            vec![Orphan {
                from_version: 1,
                to_version: 2,
                hash: shared.hash()
            }]
        );

        ndb.delete_version(1).unwrap();
        assert!(!ndb.has_node(&shared.hash()).unwrap());
        assert!(ndb.orphans().unwrap().is_empty());
        assert_eq!(ndb.versions().unwrap(), vec![3]);
    }

    #[test]
    fn test_delete_version_rejections() {
        let ndb = ndb(0);
        let mut batch = WriteBatch::new();
        ndb.save_root(&mut batch, 1, None);
        ndb.save_root(&mut batch, 2, None);
        ndb.commit(batch, &[]).unwrap();

        assert!(matches!(
            ndb.delete_version(2),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            ndb.delete_version(7),
            Err(Error::VersionNotFound(7))
        ));

        ndb.acquire_reader(1);
        assert!(matches!(
            ndb.delete_version(1),
            Err(Error::InvalidOperation(_))
        ));
        ndb.release_reader(1);
        assert_eq!(ndb.reader_count(1), 0);
        ndb.delete_version(1).unwrap();
    }

    #[test]
    fn test_discard_incomplete() {
        let ndb = ndb(0);
        let mut batch = WriteBatch::new();
        ndb.save_root(&mut batch, 1, None);
        for to in [2, 5] {
            ndb.save_orphan(
                &mut batch,
                &Orphan {
                    from_version: 1,
                    to_version: to,
                    hash: Hash::digest(&[to as u8]),
                },
            );
        }
        ndb.commit(batch, &[]).unwrap();

        assert_eq!(ndb.discard_incomplete(Some(1)).unwrap(), 2);
        assert!(ndb.orphans().unwrap().is_empty());
    }

    #[test]
    fn test_fast_nodes_range_and_version() {
        let ndb = ndb(0);
        assert_eq!(ndb.fast_version().unwrap(), None);

        let mut batch = WriteBatch::new();
        for (i, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            ndb.save_fast_node(&mut batch, *key, &FastNode::new(i as u64, key.to_vec()))
                .unwrap();
        }
        ndb.save_fast_version(&mut batch, Some(3));
        ndb.commit(batch, &[]).unwrap();

        assert_eq!(ndb.fast_version().unwrap(), Some(3));
        let keys: Vec<_> = ndb
            .fast_nodes(Some(b"b"), Some(b"d"))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(ndb.fast_nodes(None, None).unwrap().len(), 4);
        assert!(ndb.fast_nodes(Some(b"d"), Some(b"a")).unwrap().is_empty());
        // the marker is not a fast node
        assert_eq!(ndb.get_fast_node(b"d").unwrap(), Some(FastNode::new(3, b"d".to_vec())));

        let mut batch = WriteBatch::new();
        assert_eq!(ndb.clear_fast_nodes(&mut batch).unwrap(), 4);
        ndb.save_fast_version(&mut batch, None);
        ndb.commit(batch, &[]).unwrap();
        assert!(ndb.fast_nodes(None, None).unwrap().is_empty());
        assert_eq!(ndb.fast_version().unwrap(), None);
    }

    #[test]
    fn test_discard_unversioned() {
        let ndb = ndb(16);
        let node = Node::leaf(b"k".to_vec(), b"v".to_vec(), 1);
        let mut batch = WriteBatch::new();
        ndb.save_node(&mut batch, &node).unwrap();
        ndb.save_fast_node(&mut batch, b"k", &FastNode::new(1, b"v".to_vec()))
            .unwrap();
        ndb.commit(batch, &[Arc::new(node.clone())]).unwrap();

        assert_eq!(ndb.discard_unversioned().unwrap(), 2);
        assert_eq!(ndb.node_count().unwrap(), 0);
        assert!(matches!(ndb.get_node(&node.hash()), Err(Error::NodeNotFound(_))));
        assert_eq!(ndb.discard_unversioned().unwrap(), 0);

        commit_leaf(&ndb, &node, 1);
        assert!(matches!(
            ndb.discard_unversioned(),
            Err(Error::InvalidOperation(_))
        ));
    }
}
