//! Streaming export and import of a whole tree
//!
//! The exporter walks one version in post-order and emits every node with
//! the version it was created at. Replaying that stream through an
//! [`Importer`] rebuilds the same nodes, hashes included, in another store.

use super::MutableTree;
use crate::model::{Hash, Node};
use crate::node_db::NodeDb;
use crate::store::WriteBatch;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Nodes written per batch while importing
const IMPORT_BATCH_NODES: usize = 10_000;

/// One node of an export stream. Leaves carry a value, inner nodes carry
/// their split key and height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportNode {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub version: u64,
    pub height: u8,
}

/// Post-order stream of the nodes of one version
pub struct Exporter {
    ndb: Arc<NodeDb>,
    /// `(node, children already pushed)`
    stack: Vec<(Arc<Node>, bool)>,
    version: u64,
}

impl Exporter {
    pub(crate) fn new(ndb: Arc<NodeDb>, root: Option<Arc<Node>>, version: u64) -> Self {
        Exporter {
            ndb,
            stack: root.map(|root| vec![(root, false)]).unwrap_or_default(),
            version,
        }
    }

    /// Version being exported
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Iterator for Exporter {
    type Item = Result<ExportNode>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, expanded) = self.stack.pop()?;
            match node.children() {
                Some((left, right)) if !expanded => {
                    let children = self
                        .ndb
                        .get_node(&left)
                        .and_then(|left| Ok((left, self.ndb.get_node(&right)?)));
                    match children {
                        Ok((left, right)) => {
                            self.stack.push((node, true));
                            self.stack.push((right, false));
                            self.stack.push((left, false));
                        }
                        Err(e) => {
                            self.stack.clear();
                            return Some(Err(e));
                        }
                    }
                }
                _ => {
                    return Some(Ok(ExportNode {
                        key: node.key().to_vec(),
                        value: node.value().map(<[u8]>::to_vec),
                        version: node.version(),
                        height: node.height(),
                    }));
                }
            }
        }
    }
}

/// A node rebuilt by the importer, with the key bounds of its subtree
struct Built {
    node: Arc<Node>,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

/// Rebuilds a tree from an export stream into an empty store.
///
/// Nodes are written as they arrive; nothing becomes visible as a version
/// until [`commit`](Importer::commit) writes the root pointer.
pub struct Importer<'a> {
    tree: &'a mut MutableTree,
    version: u64,
    stack: Vec<Built>,
    batch: WriteBatch,
    batched: Vec<Arc<Node>>,
    imported: u64,
}

impl<'a> Importer<'a> {
    pub(crate) fn new(tree: &'a mut MutableTree, version: u64) -> Self {
        Importer {
            tree,
            version,
            stack: Vec::new(),
            batch: WriteBatch::new(),
            batched: Vec::new(),
            imported: 0,
        }
    }

    /// Add the next node of a post-order stream
    pub fn add(&mut self, item: ExportNode) -> Result<()> {
        if item.version > self.version {
            return Err(Error::Import(format!(
                "node version {} is above the import version {}",
                item.version, self.version
            )));
        }

        let built = if item.height == 0 {
            let value = item
                .value
                .ok_or_else(|| Error::Import("leaf without a value".into()))?;
            Built {
                smallest: item.key.clone(),
                largest: item.key.clone(),
                node: Arc::new(Node::leaf(item.key, value, item.version)),
            }
        } else {
            if item.value.is_some() {
                return Err(Error::Import("inner node with a value".into()));
            }
            let (Some(right), Some(left)) = (self.stack.pop(), self.stack.pop()) else {
                return Err(Error::Import("inner node without two children".into()));
            };
            if item.height != 1 + left.node.height().max(right.node.height()) {
                return Err(Error::Import(format!(
                    "inner node height {} does not match its children",
                    item.height
                )));
            }
            if left.node.version() > item.version || right.node.version() > item.version {
                return Err(Error::Import("child newer than its parent".into()));
            }
            if item.key != right.smallest {
                return Err(Error::Import(
                    "inner key is not the smallest key of its right subtree".into(),
                ));
            }
            if left.largest >= right.smallest {
                return Err(Error::Import("keys out of order".into()));
            }
            if left.node.height().abs_diff(right.node.height()) > 1 {
                return Err(Error::Import(format!(
                    "unbalanced inner node: child heights {} and {}",
                    left.node.height(),
                    right.node.height()
                )));
            }
            Built {
                node: Arc::new(Node::inner(
                    item.height,
                    left.node.size() + right.node.size(),
                    item.version,
                    item.key,
                    left.node.hash(),
                    right.node.hash(),
                )),
                smallest: left.smallest,
                largest: right.largest,
            }
        };

        let ndb = self.tree.node_db();
        ndb.save_node(&mut self.batch, &built.node)?;
        self.batched.push(built.node.clone());
        self.stack.push(built);
        self.imported += 1;

        if self.batched.len() >= IMPORT_BATCH_NODES {
            let batch = std::mem::take(&mut self.batch);
            let nodes = std::mem::take(&mut self.batched);
            self.tree.node_db().commit(batch, &nodes)?;
        }
        Ok(())
    }

    /// Write the root pointer and load the imported version into the tree,
    /// indexing its leaves for fast reads
    pub fn commit(mut self) -> Result<Hash> {
        let root = match self.stack.len() {
            0 => None,
            1 => self.stack.pop().map(|built| built.node),
            n => {
                return Err(Error::Import(format!(
                    "stream ended with {} disconnected subtrees",
                    n
                )))
            }
        };

        let ndb = self.tree.node_db().clone();
        ndb.save_root(&mut self.batch, self.version, root.as_ref().map(|n| n.hash()));
        ndb.commit(std::mem::take(&mut self.batch), &self.batched)?;
        debug!(version = self.version, nodes = self.imported, "imported tree");

        self.tree.load()?;
        Ok(self.tree.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemDb, Options};

    fn source() -> MutableTree {
        let mut tree = MutableTree::open(Arc::new(MemDb::new()), Options::default()).unwrap();
        for i in 0u8..20 {
            tree.set(vec![i], vec![i; 3]).unwrap();
        }
        tree.save_version().unwrap();
        for i in (0u8..20).step_by(3) {
            tree.set(vec![i], vec![0xaa]).unwrap();
        }
        tree.remove(&[7]).unwrap();
        tree.save_version().unwrap();
        tree
    }

    #[test]
    fn test_export_import_reproduces_root() {
        let src = source();
        let snap = src.get_immutable(2).unwrap();
        let nodes: Vec<_> = snap.export().collect::<Result<_>>().unwrap();
        assert_eq!(nodes.len() as u64, 2 * snap.size() - 1);
        assert!(nodes.iter().any(|n| n.version == 1));

        let mut dst = MutableTree::open(Arc::new(MemDb::new()), Options::default()).unwrap();
        let mut importer = dst.import(2).unwrap();
        for node in nodes {
            importer.add(node).unwrap();
        }
        let hash = importer.commit().unwrap();

        assert_eq!(hash, snap.hash());
        assert_eq!(dst.version(), 2);
        assert_eq!(dst.get(&[3]).unwrap(), Some(vec![0xaa]));
        dst.get_immutable(2).unwrap().validate().unwrap();
    }

    #[test]
    fn test_import_empty_tree() {
        let mut dst = MutableTree::open(Arc::new(MemDb::new()), Options::default()).unwrap();
        let hash = dst.import(5).unwrap().commit().unwrap();
        assert_eq!(hash, Hash::empty_root());
        assert_eq!(dst.available_versions().unwrap(), vec![5]);
    }

    #[test]
    fn test_import_rejects_malformed_streams() {
        let mut dst = MutableTree::open(Arc::new(MemDb::new()), Options::default()).unwrap();
        {
            let mut importer = dst.import(1).unwrap();
            let err = importer
                .add(ExportNode {
                    key: b"a".to_vec(),
                    value: None,
                    version: 1,
                    height: 1,
                })
                .unwrap_err();
            assert!(matches!(err, Error::Import(_)));
        }

        let leaf = |k: &[u8]| ExportNode {
            key: k.to_vec(),
            value: Some(b"v".to_vec()),
            version: 1,
            height: 0,
        };
        let inner = |k: &[u8], height: u8| ExportNode {
            key: k.to_vec(),
            value: None,
            version: 1,
            height,
        };

        // "c" sits left of the split key "b"
        {
            let mut importer = dst.import(1).unwrap();
            importer.add(leaf(b"a")).unwrap();
            importer.add(leaf(b"c")).unwrap();
            importer.add(inner(b"c", 1)).unwrap();
            importer.add(leaf(b"b")).unwrap();
            let err = importer.add(inner(b"b", 2)).unwrap_err();
            assert!(matches!(err, Error::Import(_)));
        }

        // a chain leaning left by two levels
        {
            let mut importer = dst.import(1).unwrap();
            importer.add(leaf(b"a")).unwrap();
            importer.add(leaf(b"b")).unwrap();
            importer.add(inner(b"b", 1)).unwrap();
            importer.add(leaf(b"c")).unwrap();
            importer.add(inner(b"c", 2)).unwrap();
            importer.add(leaf(b"d")).unwrap();
            let err = importer.add(inner(b"d", 3)).unwrap_err();
            assert!(matches!(err, Error::Import(_)));
        }

        let mut importer = dst.import(1).unwrap();
        importer.add(leaf(b"a")).unwrap();
        importer.add(leaf(b"b")).unwrap();
        assert!(matches!(importer.commit(), Err(Error::Import(_))));
        assert!(dst.available_versions().unwrap().is_empty());
    }

    #[test]
    fn test_import_discards_nodes_of_an_abandoned_import() {
        let src = source();
        let nodes: Vec<_> = src
            .get_immutable(2)
            .unwrap()
            .export()
            .collect::<Result<_>>()
            .unwrap();

        let mut dst = MutableTree::open(Arc::new(MemDb::new()), Options::default()).unwrap();
        // nodes flushed by an import that never wrote its root pointer
        let mut batch = WriteBatch::new();
        for i in 0u8..4 {
            let leaf = Node::leaf(vec![0xee, i], b"stray".to_vec(), 1);
            dst.node_db().save_node(&mut batch, &leaf).unwrap();
        }
        dst.node_db().commit(batch, &[]).unwrap();
        assert!(dst.node_db().node_count().unwrap() > 0);

        let mut importer = dst.import(2).unwrap();
        for node in nodes {
            importer.add(node).unwrap();
        }
        importer.commit().unwrap();
        assert_eq!(dst.node_db().node_count().unwrap() as u64, 2 * dst.size() - 1);
    }

    #[test]
    fn test_import_into_non_empty_tree_fails() {
        let mut tree = source();
        assert!(matches!(tree.import(9), Err(Error::InvalidOperation(_))));
    }
}
