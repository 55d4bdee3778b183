//! Existence and absence proofs
//!
//! A proof carries one leaf (or, for an absent key, the leaves on either
//! side of it) plus every inner node on the way up to the root: its
//! height, size, version, split key and the hash of the sibling not taken.
//! Verification folds those steps with the same [`leaf_hash`] and
//! [`inner_hash`] the tree uses, so a proof verifies exactly when it
//! reproduces the root hash.
//!
//! Absence is shown by two leaves that are adjacent in key order with the
//! key falling between them. Adjacency is checked through the leaf
//! positions derived from the authenticated subtree sizes.

use crate::model::{inner_hash, leaf_hash, Hash};
use serde::{Deserialize, Serialize};

/// Which child the path descended into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// One inner node on a leaf-to-root path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub height: u8,
    pub size: u64,
    pub version: u64,
    /// Split key of the inner node
    pub key: Vec<u8>,
    /// Hash of the child the path did not take
    pub sibling: Hash,
    pub side: Side,
}

/// A leaf and its path to the root, nearest step first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafProof {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    pub path: Vec<PathStep>,
}

impl LeafProof {
    /// Root hash this proof folds to, or `None` if the path is malformed
    /// or inconsistent with the leaf key
    pub fn root(&self) -> Option<Hash> {
        let mut hash = leaf_hash(self.version, &self.key, &self.value);
        let mut height = 0u8;
        let mut size = 1u64;
        let mut version = self.version;

        for step in &self.path {
            if step.height <= height || step.size <= size || step.version < version {
                return None;
            }
            hash = match step.side {
                Side::Left if self.key.as_slice() < step.key.as_slice() => inner_hash(
                    step.height,
                    step.size,
                    step.version,
                    &step.key,
                    &hash,
                    &step.sibling,
                ),
                Side::Right if self.key.as_slice() >= step.key.as_slice() => inner_hash(
                    step.height,
                    step.size,
                    step.version,
                    &step.key,
                    &step.sibling,
                    &hash,
                ),
                _ => return None,
            };
            height = step.height;
            size = step.size;
            version = step.version;
        }
        Some(hash)
    }

    /// Position of the leaf among all keys of the tree
    pub fn index(&self) -> Option<u64> {
        let mut index = 0u64;
        let mut child_size = 1u64;
        for step in &self.path {
            let sibling_size = step.size.checked_sub(child_size)?;
            if step.side == Side::Right {
                index = index.checked_add(sibling_size)?;
            }
            child_size = step.size;
        }
        Some(index)
    }

    /// Number of keys in the whole tree
    pub fn tree_size(&self) -> u64 {
        self.path.last().map_or(1, |step| step.size)
    }

    fn verifies(&self, root: &Hash) -> bool {
        self.root().as_ref() == Some(root)
    }
}

/// Proof that a key is present, absent, or that the tree is empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proof {
    Exists(LeafProof),
    /// The nearest leaves below and above the key; one side is missing
    /// when the key sorts before the first or after the last key
    Absent {
        left: Option<LeafProof>,
        right: Option<LeafProof>,
    },
    EmptyTree,
}

impl Proof {
    /// The proven value, for existence proofs
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Proof::Exists(leaf) => Some(&leaf.value),
            _ => None,
        }
    }

    pub fn is_existence(&self) -> bool {
        matches!(self, Proof::Exists(_))
    }

    /// Check this proof for `key` against `root`
    pub fn verify(&self, root: &Hash, key: &[u8]) -> bool {
        match self {
            Proof::Exists(leaf) => leaf.key == key && leaf.verifies(root),
            Proof::EmptyTree => *root == Hash::empty_root(),
            Proof::Absent { left, right } => verify_neighbours(root, key, left.as_ref(), right.as_ref()),
        }
    }
}

fn verify_neighbours(
    root: &Hash,
    key: &[u8],
    left: Option<&LeafProof>,
    right: Option<&LeafProof>,
) -> bool {
    if let Some(left) = left {
        if left.key.as_slice() >= key || !left.verifies(root) {
            return false;
        }
    }
    if let Some(right) = right {
        if right.key.as_slice() <= key || !right.verifies(root) {
            return false;
        }
    }
    match (left, right) {
        (None, None) => false,
        (None, Some(right)) => right.index() == Some(0),
        (Some(left), None) => left.index() == Some(left.tree_size() - 1),
        (Some(left), Some(right)) => match (left.index(), right.index()) {
            (Some(l), Some(r)) => l.checked_add(1) == Some(r),
            _ => false,
        },
    }
}

/// Verify `proof` for `key` against `root`; never errors
pub fn verify_proof(root: &Hash, key: &[u8], proof: &Proof) -> bool {
    proof.verify(root, key)
}

/// Verify that `key` maps to `value` under `root`
pub fn verify_membership(root: &Hash, key: &[u8], value: &[u8], proof: &Proof) -> bool {
    proof.value() == Some(value) && proof.verify(root, key)
}

/// Verify that `key` is absent under `root`
pub fn verify_absence(root: &Hash, key: &[u8], proof: &Proof) -> bool {
    !proof.is_existence() && proof.verify(root, key)
}
