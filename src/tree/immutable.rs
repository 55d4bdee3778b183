//! Read-only snapshot of one committed version

use super::export::Exporter;
use super::iter::RangeIter;
use crate::model::{Hash, Node};
use crate::node_db::NodeDb;
use crate::proof::{LeafProof, PathStep, Proof, Side};
use crate::{Error, Result};
use std::fmt::Write as _;
use std::sync::Arc;

/// Look `key` up below `root`
pub(crate) fn get_in(ndb: &NodeDb, root: &Arc<Node>, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut node = root.clone();
    loop {
        match node.children() {
            None => {
                return Ok((node.key() == key)
                    .then(|| node.value().map(<[u8]>::to_vec))
                    .flatten());
            }
            Some((left, right)) => {
                let next = if key < node.key() { left } else { right };
                node = ndb.get_node(&next)?;
            }
        }
    }
}

/// An immutable view of the tree at one version.
///
/// Snapshots obtained from [`MutableTree::get_immutable`](crate::MutableTree::get_immutable)
/// count as readers of their version: the version cannot be pruned while
/// any of them is alive.
pub struct ImmutableTree {
    ndb: Arc<NodeDb>,
    root: Option<Arc<Node>>,
    version: u64,
    registered: bool,
}

impl ImmutableTree {
    /// A snapshot that does not hold a reader registration
    pub(crate) fn new(ndb: Arc<NodeDb>, root: Option<Arc<Node>>, version: u64) -> Self {
        ImmutableTree {
            ndb,
            root,
            version,
            registered: false,
        }
    }

    /// A snapshot registered as a reader of `version`
    pub(crate) fn registered(ndb: Arc<NodeDb>, root: Option<Arc<Node>>, version: u64) -> Self {
        ndb.acquire_reader(version);
        ImmutableTree {
            ndb,
            root,
            version,
            registered: true,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Root hash; the hash of the empty string for an empty tree
    pub fn hash(&self) -> Hash {
        self.root
            .as_ref()
            .map_or_else(Hash::empty_root, |root| root.hash())
    }

    /// Number of keys
    pub fn size(&self) -> u64 {
        self.root.as_ref().map_or(0, |root| root.size())
    }

    pub fn height(&self) -> u8 {
        self.root.as_ref().map_or(0, |root| root.height())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.root {
            None => Ok(None),
            Some(root) => get_in(&self.ndb, root, key),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// The value of `key` and its position among all keys. For an absent
    /// key the index is where it would be inserted.
    pub fn get_with_index(&self, key: &[u8]) -> Result<(u64, Option<Vec<u8>>)> {
        let Some(mut node) = self.root.clone() else {
            return Ok((0, None));
        };
        let mut index = 0;
        loop {
            match node.children() {
                None => {
                    return Ok(match node.key().cmp(key) {
                        std::cmp::Ordering::Less => (index + 1, None),
                        std::cmp::Ordering::Greater => (index, None),
                        std::cmp::Ordering::Equal => {
                            (index, node.value().map(<[u8]>::to_vec))
                        }
                    });
                }
                Some((left, right)) => {
                    if key < node.key() {
                        node = self.ndb.get_node(&left)?;
                    } else {
                        let right = self.ndb.get_node(&right)?;
                        index += node.size() - right.size();
                        node = right;
                    }
                }
            }
        }
    }

    /// The key-value pair at position `index` in key order
    pub fn get_by_index(&self, index: u64) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(mut node) = self.root.clone() else {
            return Ok(None);
        };
        if index >= node.size() {
            return Ok(None);
        }
        let mut index = index;
        while let Some((left, right)) = node.children() {
            let left = self.ndb.get_node(&left)?;
            if index < left.size() {
                node = left;
            } else {
                index -= left.size();
                node = self.ndb.get_node(&right)?;
            }
        }
        Ok(node
            .value()
            .map(|value| (node.key().to_vec(), value.to_vec())))
    }

    /// Iterate over every key in ascending order
    pub fn iter(&self) -> RangeIter {
        self.range(None, None, true)
    }

    /// Iterate over keys in `[start, end)`; either bound may be open
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>, ascending: bool) -> RangeIter {
        RangeIter::new(
            self.ndb.clone(),
            self.root.clone(),
            start.map(<[u8]>::to_vec),
            end.map(<[u8]>::to_vec),
            ascending,
        )
    }

    /// Look `key` up together with a proof of the answer against [`hash`](Self::hash)
    pub fn get_with_proof(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, Proof)> {
        let Some(root) = &self.root else {
            return Ok((None, Proof::EmptyTree));
        };

        let (index, value) = self.get_with_index(key)?;
        if value.is_some() {
            let proof = self.leaf_proof(index)?;
            return Ok((value, Proof::Exists(proof)));
        }

        let left = match index {
            0 => None,
            i => Some(self.leaf_proof(i - 1)?),
        };
        let right = if index < root.size() {
            Some(self.leaf_proof(index)?)
        } else {
            None
        };
        Ok((None, Proof::Absent { left, right }))
    }

    /// Proof for the leaf at `index`
    fn leaf_proof(&self, index: u64) -> Result<LeafProof> {
        let mut node = self
            .root
            .clone()
            .ok_or_else(|| Error::InvalidOperation("empty tree has no leaves".into()))?;
        let mut index = index;
        let mut path = Vec::with_capacity(node.height() as usize);

        while let Some((left_hash, right_hash)) = node.children() {
            let left = self.ndb.get_node(&left_hash)?;
            let (side, sibling, next) = if index < left.size() {
                (Side::Left, right_hash, left)
            } else {
                index -= left.size();
                (Side::Right, left_hash, self.ndb.get_node(&right_hash)?)
            };
            path.push(PathStep {
                height: node.height(),
                size: node.size(),
                version: node.version(),
                key: node.key().to_vec(),
                sibling,
                side,
            });
            node = next;
        }
        path.reverse();

        let value = node
            .value()
            .ok_or_else(|| Error::Corruption("descent ended on an inner node".into()))?;
        Ok(LeafProof {
            key: node.key().to_vec(),
            value: value.to_vec(),
            version: node.version(),
            path,
        })
    }

    /// Stream every node in post-order for [`Importer`](crate::Importer)
    pub fn export(&self) -> Exporter {
        Exporter::new(self.ndb.clone(), self.root.clone(), self.version)
    }

    /// Walk the whole tree and check its structural invariants: AVL balance,
    /// heights, sizes, key order, split keys and child versions.
    pub fn validate(&self) -> Result<()> {
        if let Some(root) = &self.root {
            if root.version() > self.version {
                return Err(Error::Corruption(format!(
                    "root of version {} was created at version {}",
                    self.version,
                    root.version()
                )));
            }
            let mut previous = None;
            self.validate_node(root, &mut previous)?;
        }
        Ok(())
    }

    /// Returns the smallest key below `node`
    fn validate_node(&self, node: &Node, previous: &mut Option<Vec<u8>>) -> Result<Vec<u8>> {
        let corrupt = |what: &str| {
            Error::Corruption(format!("{} at node {}", what, node.hash().short()))
        };

        let Some((left, right)) = node.children() else {
            if let Some(prev) = previous.as_deref() {
                if prev >= node.key() {
                    return Err(corrupt("leaves out of order"));
                }
            }
            *previous = Some(node.key().to_vec());
            return Ok(node.key().to_vec());
        };

        let left = self.ndb.get_node(&left)?;
        let right = self.ndb.get_node(&right)?;
        if left.version() > node.version() || right.version() > node.version() {
            return Err(corrupt("child newer than parent"));
        }
        if (left.height() as i16 - right.height() as i16).abs() > 1 {
            return Err(corrupt("unbalanced children"));
        }
        if node.height() != 1 + left.height().max(right.height()) {
            return Err(corrupt("wrong height"));
        }
        if node.size() != left.size() + right.size() {
            return Err(corrupt("wrong size"));
        }

        let smallest = self.validate_node(&left, previous)?;
        let right_smallest = self.validate_node(&right, previous)?;
        if right_smallest != node.key() {
            return Err(corrupt("split key is not the smallest key of the right subtree"));
        }
        Ok(smallest)
    }

    /// Human-readable dump of the tree, right subtree above left
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        match &self.root {
            None => out.push_str("(empty)\n"),
            Some(root) => self.render_node(root, 0, &mut out)?,
        }
        Ok(out)
    }

    fn render_node(&self, node: &Node, depth: usize, out: &mut String) -> Result<()> {
        let indent = "    ".repeat(depth);
        match node.children() {
            None => {
                let value = node.value().unwrap_or_default();
                let _ = writeln!(
                    out,
                    "{}{} = {} (v{})",
                    indent,
                    display_bytes(node.key()),
                    display_bytes(value),
                    node.version()
                );
            }
            Some((left, right)) => {
                let right = self.ndb.get_node(&right)?;
                self.render_node(&right, depth + 1, out)?;
                let _ = writeln!(
                    out,
                    "{}[{}] h{} s{} v{} {}",
                    indent,
                    display_bytes(node.key()),
                    node.height(),
                    node.size(),
                    node.version(),
                    node.hash().short()
                );
                let left = self.ndb.get_node(&left)?;
                self.render_node(&left, depth + 1, out)?;
            }
        }
        Ok(())
    }
}

/// Printable keys as text, anything else as hex
fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}

impl Clone for ImmutableTree {
    fn clone(&self) -> Self {
        if self.registered {
            self.ndb.acquire_reader(self.version);
        }
        ImmutableTree {
            ndb: self.ndb.clone(),
            root: self.root.clone(),
            version: self.version,
            registered: self.registered,
        }
    }
}

impl Drop for ImmutableTree {
    fn drop(&mut self) {
        if self.registered {
            self.ndb.release_reader(self.version);
        }
    }
}

impl std::fmt::Debug for ImmutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableTree")
            .field("version", &self.version)
            .field("hash", &self.hash())
            .field("size", &self.size())
            .finish()
    }
}
