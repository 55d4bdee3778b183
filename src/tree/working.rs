//! Copy-on-write working graph
//!
//! A commit starts from the last saved root and applies its writes to a
//! graph mixing committed nodes (`Saved`) with freshly built ones (`Draft`).
//! Touching a committed node copies it into a draft and records it as
//! orphaned at the version being built. Drafts only receive a version,
//! and therefore a hash, when the graph is persisted.

use crate::model::keys::Orphan;
use crate::model::Node;
use crate::node_db::NodeDb;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

use super::immutable::get_in;

pub(crate) enum Subtree {
    Saved(Arc<Node>),
    Draft(Box<Draft>),
}

pub(crate) struct Draft {
    height: u8,
    size: u64,
    key: Vec<u8>,
    body: DraftBody,
}

enum DraftBody {
    Leaf { value: Vec<u8> },
    Inner { left: Subtree, right: Subtree },
}

impl Subtree {
    fn leaf(key: &[u8], value: Vec<u8>) -> Self {
        Subtree::Draft(Box::new(Draft {
            height: 0,
            size: 1,
            key: key.to_vec(),
            body: DraftBody::Leaf { value },
        }))
    }

    /// Inner draft over two subtrees; height and size follow from the children
    fn inner(key: Vec<u8>, left: Subtree, right: Subtree) -> Self {
        Subtree::Draft(Box::new(Draft {
            height: 1 + left.height().max(right.height()),
            size: left.size() + right.size(),
            key,
            body: DraftBody::Inner { left, right },
        }))
    }

    fn height(&self) -> u8 {
        match self {
            Subtree::Saved(node) => node.height(),
            Subtree::Draft(draft) => draft.height,
        }
    }

    fn size(&self) -> u64 {
        match self {
            Subtree::Saved(node) => node.size(),
            Subtree::Draft(draft) => draft.size,
        }
    }

    fn key(&self) -> &[u8] {
        match self {
            Subtree::Saved(node) => node.key(),
            Subtree::Draft(draft) => &draft.key,
        }
    }

    fn is_leaf(&self) -> bool {
        self.height() == 0
    }
}

/// What [`WorkingTree::finish`] hands to the node database
pub(crate) struct Built {
    pub root: Option<Arc<Node>>,
    /// Nodes created at the new version, children before parents
    pub nodes: Vec<Arc<Node>>,
    pub orphans: Vec<Orphan>,
}

struct Removal {
    subtree: Option<Subtree>,
    /// New smallest key of the subtree, when it changed
    new_key: Option<Vec<u8>>,
    value: Vec<u8>,
}

/// The tree being assembled for `version`
pub(crate) struct WorkingTree<'a> {
    ndb: &'a NodeDb,
    version: u64,
    root: Option<Subtree>,
    orphans: Vec<Orphan>,
}

impl<'a> WorkingTree<'a> {
    pub fn new(ndb: &'a NodeDb, root: Option<Arc<Node>>, version: u64) -> Self {
        WorkingTree {
            ndb,
            version,
            root: root.map(Subtree::Saved),
            orphans: Vec::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(mut current) = self.root.as_ref() else {
            return Ok(None);
        };
        loop {
            match current {
                Subtree::Saved(node) => return get_in(self.ndb, node, key),
                Subtree::Draft(draft) => match &draft.body {
                    DraftBody::Leaf { value } => {
                        return Ok((draft.key == key).then(|| value.clone()));
                    }
                    DraftBody::Inner { left, right } => {
                        current = if key < draft.key.as_slice() { left } else { right };
                    }
                },
            }
        }
    }

    /// Insert or update; returns true when the key already existed
    pub fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<bool> {
        let (root, updated) = match self.root.take() {
            None => (Subtree::leaf(key, value), false),
            Some(root) => self.set_in(root, key, value)?,
        };
        self.root = Some(root);
        Ok(updated)
    }

    /// Remove `key`, returning its value if it was present
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.get(key)?.is_none() {
            return Ok(None);
        }
        let Some(root) = self.root.take() else {
            return Ok(None);
        };
        let removal = self.remove_in(root, key)?;
        self.root = removal.subtree;
        Ok(Some(removal.value))
    }

    /// Assign the version to every draft and return the resulting nodes
    pub fn finish(mut self) -> Built {
        let mut nodes = Vec::new();
        let root = self
            .root
            .take()
            .map(|root| persist(root, self.version, &mut nodes));
        Built {
            root,
            nodes,
            orphans: self.orphans,
        }
    }

    fn set_in(&mut self, subtree: Subtree, key: &[u8], value: Vec<u8>) -> Result<(Subtree, bool)> {
        if subtree.is_leaf() {
            return Ok(match key.cmp(subtree.key()) {
                Ordering::Less => {
                    let split = subtree.key().to_vec();
                    (Subtree::inner(split, Subtree::leaf(key, value), subtree), false)
                }
                Ordering::Greater => (
                    Subtree::inner(key.to_vec(), subtree, Subtree::leaf(key, value)),
                    false,
                ),
                Ordering::Equal => {
                    self.discard(subtree);
                    (Subtree::leaf(key, value), true)
                }
            });
        }

        let (split, left, right) = self.open_inner(subtree)?;
        if key < split.as_slice() {
            let (left, updated) = self.set_in(left, key, value)?;
            Ok((self.balance(split, left, right)?, updated))
        } else {
            let (right, updated) = self.set_in(right, key, value)?;
            Ok((self.balance(split, left, right)?, updated))
        }
    }

    /// Remove a key known to be present below `subtree`
    fn remove_in(&mut self, subtree: Subtree, key: &[u8]) -> Result<Removal> {
        if subtree.is_leaf() {
            let value = match &subtree {
                Subtree::Saved(node) => node.value().map(<[u8]>::to_vec).unwrap_or_default(),
                Subtree::Draft(draft) => match &draft.body {
                    DraftBody::Leaf { value } => value.clone(),
                    DraftBody::Inner { .. } => Vec::new(),
                },
            };
            self.discard(subtree);
            return Ok(Removal {
                subtree: None,
                new_key: None,
                value,
            });
        }

        let (split, left, right) = self.open_inner(subtree)?;
        if key < split.as_slice() {
            let removal = self.remove_in(left, key)?;
            match removal.subtree {
                // The right subtree takes this node's place; its smallest key is `split`
                None => Ok(Removal {
                    subtree: Some(right),
                    new_key: Some(split),
                    value: removal.value,
                }),
                Some(left) => Ok(Removal {
                    subtree: Some(self.balance(split, left, right)?),
                    new_key: removal.new_key,
                    value: removal.value,
                }),
            }
        } else {
            let removal = self.remove_in(right, key)?;
            match removal.subtree {
                None => Ok(Removal {
                    subtree: Some(left),
                    new_key: None,
                    value: removal.value,
                }),
                Some(right) => {
                    let split = removal.new_key.unwrap_or(split);
                    Ok(Removal {
                        subtree: Some(self.balance(split, left, right)?),
                        new_key: None,
                        value: removal.value,
                    })
                }
            }
        }
    }

    /// Rebuild an inner node over `left` and `right`, rotating when their
    /// heights differ by more than one
    fn balance(&mut self, key: Vec<u8>, left: Subtree, right: Subtree) -> Result<Subtree> {
        let diff = left.height() as i16 - right.height() as i16;

        if diff > 1 {
            let (left_key, ll, lr) = self.open_inner(left)?;
            if ll.height() >= lr.height() {
                // left-left: single right rotation
                let node = Subtree::inner(key, lr, right);
                return Ok(Subtree::inner(left_key, ll, node));
            }
            // left-right
            let (lr_key, lrl, lrr) = self.open_inner(lr)?;
            let new_left = Subtree::inner(left_key, ll, lrl);
            let new_right = Subtree::inner(key, lrr, right);
            return Ok(Subtree::inner(lr_key, new_left, new_right));
        }

        if diff < -1 {
            let (right_key, rl, rr) = self.open_inner(right)?;
            if rr.height() >= rl.height() {
                // right-right: single left rotation
                let node = Subtree::inner(key, left, rl);
                return Ok(Subtree::inner(right_key, node, rr));
            }
            // right-left
            let (rl_key, rll, rlr) = self.open_inner(rl)?;
            let new_left = Subtree::inner(key, left, rll);
            let new_right = Subtree::inner(right_key, rlr, rr);
            return Ok(Subtree::inner(rl_key, new_left, new_right));
        }

        Ok(Subtree::inner(key, left, right))
    }

    /// Take an inner node apart for rebuilding. A committed node is orphaned
    /// and its children are loaded.
    fn open_inner(&mut self, subtree: Subtree) -> Result<(Vec<u8>, Subtree, Subtree)> {
        match subtree {
            Subtree::Draft(draft) => match draft.body {
                DraftBody::Inner { left, right } => Ok((draft.key, left, right)),
                DraftBody::Leaf { .. } => Err(crate::Error::Corruption(
                    "expected an inner node, found a leaf".into(),
                )),
            },
            Subtree::Saved(node) => {
                let (left, right) = node.children().ok_or_else(|| {
                    crate::Error::Corruption(format!(
                        "expected an inner node, found leaf {}",
                        node.hash().short()
                    ))
                })?;
                let left = self.ndb.get_node(&left)?;
                let right = self.ndb.get_node(&right)?;
                self.orphan(&node);
                Ok((
                    node.key().to_vec(),
                    Subtree::Saved(left),
                    Subtree::Saved(right),
                ))
            }
        }
    }

    fn discard(&mut self, subtree: Subtree) {
        if let Subtree::Saved(node) = subtree {
            self.orphan(&node);
        }
    }

    fn orphan(&mut self, node: &Node) {
        self.orphans.push(Orphan {
            from_version: node.version(),
            to_version: self.version,
            hash: node.hash(),
        });
    }
}

fn persist(subtree: Subtree, version: u64, nodes: &mut Vec<Arc<Node>>) -> Arc<Node> {
    let draft = match subtree {
        Subtree::Saved(node) => return node,
        Subtree::Draft(draft) => *draft,
    };
    let node = match draft.body {
        DraftBody::Leaf { value } => Node::leaf(draft.key, value, version),
        DraftBody::Inner { left, right } => {
            let left = persist(left, version, nodes);
            let right = persist(right, version, nodes);
            Node::inner(
                draft.height,
                draft.size,
                version,
                draft.key,
                left.hash(),
                right.hash(),
            )
        }
    };
    let node = Arc::new(node);
    nodes.push(node.clone());
    node
}
