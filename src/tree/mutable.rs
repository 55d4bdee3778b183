//! The write side of the tree: pending writes, commits and version management

use super::export::{Exporter, Importer};
use super::immutable::{get_in, ImmutableTree};
use super::iter::{MergedIter, RangeIter, SavedIter};
use super::working::{Built, WorkingTree};
use crate::model::{FastNode, Hash, Node, MAX_KEY_LEN};
use crate::node_db::NodeDb;
use crate::proof::Proof;
use crate::store::{KvStore, WriteBatch};
use crate::{Error, Options, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A versioned tree accepting writes.
///
/// Writes are buffered until [`save_version`](MutableTree::save_version),
/// which applies them in key order to the last saved version, persists the
/// new nodes with their orphan records and root pointer in one atomic
/// batch, and returns the new root hash and version.
///
/// Reads of the latest version go through the fast index, a flat
/// `key -> value` copy of that version kept in the same commit batch.
///
/// One writer at a time: callers serialize access to a `MutableTree`.
/// Snapshots from [`get_immutable`](MutableTree::get_immutable) can be read
/// from other threads.
pub struct MutableTree {
    ndb: Arc<NodeDb>,
    options: Options,
    /// Root of the last saved (or loaded) version
    root: Option<Arc<Node>>,
    /// Last saved version, 0 before the first commit
    version: u64,
    /// Uncommitted writes; `None` marks a removal
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// The fast index describes `version`
    fast_reads: bool,
}

impl MutableTree {
    /// Open a tree over `db` at its latest version
    pub fn open(db: Arc<dyn KvStore>, options: Options) -> Result<Self> {
        options.validate()?;
        let ndb = Arc::new(NodeDb::new(db, options.cache_size));
        let mut tree = MutableTree {
            ndb,
            options,
            root: None,
            version: 0,
            pending: BTreeMap::new(),
            fast_reads: false,
        };
        tree.load()?;
        Ok(tree)
    }

    /// Reload the latest committed version, discarding pending writes
    pub fn load(&mut self) -> Result<u64> {
        let latest = self.ndb.latest_version()?;
        self.ndb.discard_incomplete(latest)?;
        self.sync_fast_index(latest)?;
        match latest {
            Some(version) => self.load_version(version),
            None => {
                self.root = None;
                self.version = 0;
                self.pending.clear();
                self.fast_reads = true;
                Ok(0)
            }
        }
    }

    /// Load a committed version as the base for the next commit.
    /// Version 0 means the latest.
    pub fn load_version(&mut self, version: u64) -> Result<u64> {
        if version == 0 {
            return self.load();
        }
        let root = self.load_root(version)?;
        self.root = root;
        self.version = version;
        self.pending.clear();
        self.fast_reads = self.ndb.fast_version()? == Some(version);
        debug!(
            version,
            hash = %self.hash().short(),
            fast_reads = self.fast_reads,
            "loaded version"
        );
        Ok(version)
    }

    /// Load `version` and delete every later version, so the next commit
    /// writes `version + 1` afresh. A version above the latest loads the latest.
    pub fn load_version_for_overwriting(&mut self, version: u64) -> Result<u64> {
        let latest = self
            .ndb
            .latest_version()?
            .ok_or(Error::VersionNotFound(version))?;
        let target = version.min(latest);
        self.load_version(target)?;
        self.ndb.delete_versions_from(target + 1)?;
        self.sync_fast_index(Some(target))?;
        self.fast_reads = true;
        Ok(target)
    }

    /// Rebuild the fast index from the tree of `latest` unless it already
    /// describes that version
    fn sync_fast_index(&self, latest: Option<u64>) -> Result<()> {
        if self.ndb.fast_version()? == latest {
            return Ok(());
        }
        let root = match latest {
            Some(version) => self.load_root(version)?,
            None => None,
        };

        let mut batch = WriteBatch::new();
        let cleared = self.ndb.clear_fast_nodes(&mut batch)?;
        let mut written = 0usize;
        for node in Exporter::new(self.ndb.clone(), root, latest.unwrap_or(0)) {
            let node = node?;
            if let Some(value) = node.value {
                self.ndb
                    .save_fast_node(&mut batch, &node.key, &FastNode::new(node.version, value))?;
                written += 1;
            }
        }
        self.ndb.save_fast_version(&mut batch, latest);
        self.ndb.store().write(batch)?;
        debug!(version = ?latest, cleared, written, "rebuilt fast index");
        Ok(())
    }

    fn load_root(&self, version: u64) -> Result<Option<Arc<Node>>> {
        match self.ndb.get_root(version)? {
            None => Ok(None),
            Some(hash) => Ok(Some(self.ndb.get_node(&hash)?)),
        }
    }

    // === Writes ===

    /// Set `key` to `value`; returns true when the key was not present before
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<bool> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidOperation(format!(
                "key of {} bytes exceeds the maximum of {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        let existed = self.get(&key)?.is_some();
        self.pending.insert(key, Some(value));
        Ok(!existed)
    }

    /// Remove `key`, returning the value it had
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(value) = self.get(key)? else {
            return Ok(None);
        };
        if self.saved_get(key)?.is_some() {
            self.pending.insert(key.to_vec(), None);
        } else {
            self.pending.remove(key);
        }
        Ok(Some(value))
    }

    /// Discard every uncommitted write
    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    /// Number of uncommitted writes
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // === Reads ===

    /// Value of `key` in the working state (last saved version plus pending writes)
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.saved_get(key),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn saved_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.fast_reads {
            return Ok(self.ndb.get_fast_node(key)?.map(|node| node.value));
        }
        match &self.root {
            None => Ok(None),
            Some(root) => get_in(&self.ndb, root, key),
        }
    }

    /// Value of `key` at a committed version
    pub fn get_versioned(&self, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        if version == self.version && self.version != 0 {
            return self.saved_get(key);
        }
        match self.load_root(version)? {
            None => Ok(None),
            Some(root) => get_in(&self.ndb, &root, key),
        }
    }

    /// Value of `key` at `version` with a proof against that version's root hash
    pub fn get_with_proof(&self, key: &[u8], version: u64) -> Result<(Option<Vec<u8>>, Proof)> {
        self.get_immutable(version)?.get_with_proof(key)
    }

    /// Iterate over the working state within `[start, end)`
    pub fn range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> MergedIter<'a> {
        let saved = if self.fast_reads {
            SavedIter::fast(&self.ndb, start, end, ascending)
        } else {
            SavedIter::Tree(RangeIter::new(
                self.ndb.clone(),
                self.root.clone(),
                start.map(<[u8]>::to_vec),
                end.map(<[u8]>::to_vec),
                ascending,
            ))
        };
        MergedIter::new(saved, &self.pending, start, end, ascending)
    }

    pub fn iter(&self) -> MergedIter<'_> {
        self.range(None, None, true)
    }

    /// A read-only snapshot of `version`, registered as a reader of it
    pub fn get_immutable(&self, version: u64) -> Result<ImmutableTree> {
        let root = self.load_root(version)?;
        Ok(ImmutableTree::registered(self.ndb.clone(), root, version))
    }

    /// A read-only snapshot of the last saved version
    pub fn snapshot(&self) -> ImmutableTree {
        if self.version == 0 {
            ImmutableTree::new(self.ndb.clone(), self.root.clone(), 0)
        } else {
            ImmutableTree::registered(self.ndb.clone(), self.root.clone(), self.version)
        }
    }

    /// Root hash of the last saved version
    pub fn hash(&self) -> Hash {
        self.root
            .as_ref()
            .map_or_else(Hash::empty_root, |root| root.hash())
    }

    /// Number of keys in the last saved version
    pub fn size(&self) -> u64 {
        self.root.as_ref().map_or(0, |root| root.size())
    }

    /// Height of the last saved version
    pub fn height(&self) -> u8 {
        self.root.as_ref().map_or(0, |root| root.height())
    }

    /// True when the last saved version holds no keys
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Last saved or loaded version, 0 before the first commit
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn latest_version(&self) -> Result<Option<u64>> {
        self.ndb.latest_version()
    }

    pub fn available_versions(&self) -> Result<Vec<u64>> {
        self.ndb.versions()
    }

    pub fn version_exists(&self, version: u64) -> Result<bool> {
        self.ndb.version_exists(version)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn node_db(&self) -> &Arc<NodeDb> {
        &self.ndb
    }

    // === Commits ===

    fn next_version(&self) -> u64 {
        if self.version == 0 {
            self.options.initial_version
        } else {
            self.version + 1
        }
    }

    /// Apply the pending writes to the last saved root without persisting
    fn build(&self, version: u64) -> Result<Built> {
        let mut working = WorkingTree::new(&self.ndb, self.root.clone(), version);
        for (key, value) in &self.pending {
            match value {
                Some(value) => {
                    working.set(key, value.clone())?;
                }
                None => {
                    working.remove(key)?;
                }
            }
        }
        Ok(working.finish())
    }

    /// Root hash the next [`save_version`](Self::save_version) would produce
    pub fn working_hash(&self) -> Result<Hash> {
        if self.pending.is_empty() {
            return Ok(self.hash());
        }
        let built = self.build(self.next_version())?;
        Ok(built
            .root
            .map_or_else(Hash::empty_root, |root| root.hash()))
    }

    /// Commit the pending writes as the next version and return its
    /// `(root hash, version)`.
    ///
    /// Saving over a version that already exists (after loading an older
    /// one) succeeds without writing when the resulting root is identical,
    /// and fails with [`Error::VersionConflict`] otherwise.
    pub fn save_version(&mut self) -> Result<(Hash, u64)> {
        if self.pending.is_empty() && self.options.skip_empty_versions {
            return Ok((self.hash(), self.version));
        }

        let target = self.next_version();
        if self.ndb.version_exists(target)? {
            let stored = self.ndb.get_root(target)?.unwrap_or_else(Hash::empty_root);
            let working = self.working_hash()?;
            if stored != working {
                return Err(Error::VersionConflict {
                    version: target,
                    expected: stored,
                    found: working,
                });
            }
            debug!(version = target, "version already saved with the same root");
            self.load_version(target)?;
            return Ok((working, target));
        }
        if let Some(latest) = self.ndb.latest_version()? {
            if latest > target {
                return Err(Error::InvalidOperation(format!(
                    "cannot save version {} below latest version {}",
                    target, latest
                )));
            }
        }

        let built = self.build(target)?;
        let mut batch = WriteBatch::new();
        for node in &built.nodes {
            self.ndb.save_node(&mut batch, node)?;
        }
        for orphan in &built.orphans {
            self.ndb.save_orphan(&mut batch, orphan);
        }
        self.ndb
            .save_root(&mut batch, target, built.root.as_ref().map(|n| n.hash()));
        for (key, value) in &self.pending {
            match value {
                Some(value) => {
                    let node = FastNode::new(target, value.clone());
                    self.ndb.save_fast_node(&mut batch, key, &node)?;
                }
                None => self.ndb.delete_fast_node(&mut batch, key),
            }
        }
        self.ndb.save_fast_version(&mut batch, Some(target));
        self.ndb.commit(batch, &built.nodes)?;

        self.root = built.root;
        self.version = target;
        self.pending.clear();
        self.fast_reads = true;
        debug!(
            version = target,
            hash = %self.hash().short(),
            nodes = built.nodes.len(),
            orphans = built.orphans.len(),
            "saved version"
        );

        if let Some(keep) = self.options.keep_recent {
            // the version is durable; a failed prune is retried after the next commit
            if let Err(e) = self.prune_to_recent(keep) {
                warn!(version = target, error = %e, "pruning old versions failed");
            }
        }
        Ok((self.hash(), target))
    }

    fn prune_to_recent(&mut self, keep: u64) -> Result<()> {
        let versions = self.ndb.versions()?;
        let keep = usize::try_from(keep.max(1)).unwrap_or(usize::MAX);
        let excess = versions.len().saturating_sub(keep);
        for &version in &versions[..excess] {
            if self.ndb.reader_count(version) > 0 {
                debug!(version, "keeping version with active readers");
                continue;
            }
            self.ndb.delete_version(version)?;
        }
        Ok(())
    }

    // === Pruning ===

    /// Delete a committed version, freeing nodes no retained version uses
    pub fn delete_version(&mut self, version: u64) -> Result<()> {
        if version == self.version && self.ndb.version_exists(version)? {
            return Err(Error::InvalidOperation(format!(
                "cannot delete loaded version {}",
                version
            )));
        }
        self.ndb.delete_version(version)
    }

    /// Delete every committed version `<= version`
    pub fn delete_versions_to(&mut self, version: u64) -> Result<()> {
        let versions = self.ndb.versions()?;
        if versions.last().map_or(true, |latest| version >= *latest) {
            return Err(Error::InvalidOperation(format!(
                "cannot delete up to version {}: it must be below the latest version",
                version
            )));
        }
        for v in versions.into_iter().filter(|v| *v <= version) {
            self.delete_version(v)?;
        }
        Ok(())
    }

    /// Start importing an exported tree as `version`. The store must not
    /// hold any version yet.
    pub fn import(&mut self, version: u64) -> Result<Importer<'_>> {
        if version == 0 {
            return Err(Error::InvalidOperation("cannot import as version 0".into()));
        }
        if self.ndb.latest_version()?.is_some() || !self.pending.is_empty() {
            return Err(Error::InvalidOperation(
                "import requires an empty tree".into(),
            ));
        }
        self.ndb.discard_unversioned()?;
        Ok(Importer::new(self, version))
    }
}

impl std::fmt::Debug for MutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableTree")
            .field("version", &self.version)
            .field("hash", &self.hash())
            .field("pending", &self.pending.len())
            .finish()
    }
}
