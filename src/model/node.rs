//! Persisted tree nodes and the node hash preimage
//!
//! A committed node is immutable: its hash is computed once from
//! `(height, size, version, key, value-or-children)` and is also its
//! storage address. Proof verification folds hashes with the very same
//! [`leaf_hash`] / [`inner_hash`] functions.

use super::Hash;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Version byte leading every hash preimage
pub const HASH_FORMAT: u8 = 1;

const LEAF_TAG: u8 = 0;
const INNER_TAG: u8 = 1;

/// Hash of a leaf node.
///
/// Preimage: `format || 0x00 || height(0) || size(1):be64 || version:be64 ||
/// len(key):be32 || key || H(value)`. The value is hashed separately so a
/// proof can carry a value hash instead of the value itself.
pub fn leaf_hash(version: u64, key: &[u8], value: &[u8]) -> Hash {
    let value_hash = Hash::digest(value);
    Hash::digest_many(&[
        &[HASH_FORMAT, LEAF_TAG, 0],
        &1u64.to_be_bytes(),
        &version.to_be_bytes(),
        &key_len(key).to_be_bytes(),
        key,
        value_hash.as_bytes(),
    ])
}

/// Hash of an inner node.
///
/// Preimage: `format || 0x01 || height || size:be64 || version:be64 ||
/// len(key):be32 || key || left || right`.
pub fn inner_hash(
    height: u8,
    size: u64,
    version: u64,
    key: &[u8],
    left: &Hash,
    right: &Hash,
) -> Hash {
    Hash::digest_many(&[
        &[HASH_FORMAT, INNER_TAG, height],
        &size.to_be_bytes(),
        &version.to_be_bytes(),
        &key_len(key).to_be_bytes(),
        key,
        left.as_bytes(),
        right.as_bytes(),
    ])
}

/// Longest key the 32-bit length prefix can describe
pub const MAX_KEY_LEN: usize = u32::MAX as usize;

fn key_len(key: &[u8]) -> u32 {
    // MutableTree::set rejects keys above MAX_KEY_LEN
    key.len() as u32
}

/// Payload of a node: a value for leaves, two child hashes for inner nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeBody {
    Leaf { value: Vec<u8> },
    Inner { left: Hash, right: Hash },
}

/// A committed, content-addressed tree node
#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    height: u8,
    size: u64,
    version: u64,
    /// Leaf key, or for inner nodes the smallest key of the right subtree
    key: Vec<u8>,
    body: NodeBody,
    hash: Hash,
}

/// On-disk form of a node. The hash is not stored: it is the record's address.
#[derive(Serialize, Deserialize)]
struct NodeRecord<'a> {
    height: u8,
    size: u64,
    version: u64,
    key: Cow<'a, [u8]>,
    body: Cow<'a, NodeBody>,
}

impl Node {
    /// Create a leaf node
    pub fn leaf(key: Vec<u8>, value: Vec<u8>, version: u64) -> Self {
        let hash = leaf_hash(version, &key, &value);
        Node {
            height: 0,
            size: 1,
            version,
            key,
            body: NodeBody::Leaf { value },
            hash,
        }
    }

    /// Create an inner node over two already-hashed children
    pub fn inner(
        height: u8,
        size: u64,
        version: u64,
        key: Vec<u8>,
        left: Hash,
        right: Hash,
    ) -> Self {
        let hash = inner_hash(height, size, version, &key, &left, &right);
        Node {
            height,
            size,
            version,
            key,
            body: NodeBody::Inner { left, right },
            hash,
        }
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn body(&self) -> &NodeBody {
        &self.body
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf { .. })
    }

    /// The value stored at a leaf
    pub fn value(&self) -> Option<&[u8]> {
        match &self.body {
            NodeBody::Leaf { value } => Some(value),
            NodeBody::Inner { .. } => None,
        }
    }

    /// The `(left, right)` child hashes of an inner node
    pub fn children(&self) -> Option<(Hash, Hash)> {
        match &self.body {
            NodeBody::Leaf { .. } => None,
            NodeBody::Inner { left, right } => Some((*left, *right)),
        }
    }

    /// Serialize for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        let record = NodeRecord {
            height: self.height,
            size: self.size,
            version: self.version,
            key: Cow::Borrowed(&self.key),
            body: Cow::Borrowed(&self.body),
        };
        Ok(bincode::serialize(&record)?)
    }

    /// Deserialize a node stored under `expected`, re-deriving and checking its hash
    pub fn decode(expected: &Hash, bytes: &[u8]) -> Result<Self> {
        let record: NodeRecord<'_> = bincode::deserialize(bytes).map_err(|e| {
            Error::Corruption(format!("undecodable node {}: {}", expected.short(), e))
        })?;

        let key = record.key.into_owned();
        let node = match record.body.into_owned() {
            NodeBody::Leaf { value } => {
                if record.height != 0 || record.size != 1 {
                    return Err(Error::Corruption(format!(
                        "leaf {} has height {} and size {}",
                        expected.short(),
                        record.height,
                        record.size
                    )));
                }
                Node::leaf(key, value, record.version)
            }
            NodeBody::Inner { left, right } => {
                if record.height == 0 || record.size < 2 {
                    return Err(Error::Corruption(format!(
                        "inner node {} has height {} and size {}",
                        expected.short(),
                        record.height,
                        record.size
                    )));
                }
                Node::inner(
                    record.height,
                    record.size,
                    record.version,
                    key,
                    left,
                    right,
                )
            }
        };

        if node.hash != *expected {
            return Err(Error::Corruption(format!(
                "node stored under {} hashes to {}",
                expected.short(),
                node.hash.short()
            )));
        }
        Ok(node)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            NodeBody::Leaf { value } => write!(
                f,
                "Leaf{{{}:{} @{} {}}}",
                hex::encode(&self.key),
                hex::encode(value),
                self.version,
                self.hash.short()
            ),
            NodeBody::Inner { left, right } => write!(
                f,
                "Inner{{{} @{} h{} s{} {} [{} {}]}}",
                hex::encode(&self.key),
                self.version,
                self.height,
                self.size,
                self.hash.short(),
                left.short(),
                right.short()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_hash_deterministic() {
        let a = Node::leaf(b"key".to_vec(), b"value".to_vec(), 1);
        let b = Node::leaf(b"key".to_vec(), b"value".to_vec(), 1);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash(), leaf_hash(1, b"key", b"value"));
    }

    #[test]
    fn test_leaf_hash_covers_every_field() {
        let base = leaf_hash(1, b"key", b"value");
        assert_ne!(base, leaf_hash(2, b"key", b"value"));
        assert_ne!(base, leaf_hash(1, b"kez", b"value"));
        assert_ne!(base, leaf_hash(1, b"key", b"valuf"));
    }

    #[test]
    fn test_preimage_has_no_field_boundary_ambiguity() {
        assert_ne!(leaf_hash(1, b"ab", b"c"), leaf_hash(1, b"a", b"bc"));
        let l = Hash::digest(b"l");
        let r = Hash::digest(b"r");
        assert_ne!(
            inner_hash(1, 2, 1, b"k", &l, &r),
            inner_hash(1, 2, 1, b"k", &r, &l)
        );
    }

    #[test]
    fn test_inner_and_leaf_domains_differ() {
        let l = Hash::digest(b"l");
        let r = Hash::digest(b"r");
        let inner = inner_hash(1, 2, 1, b"k", &l, &r);
        assert_ne!(inner, inner_hash(2, 2, 1, b"k", &l, &r));
        assert_ne!(inner, inner_hash(1, 3, 1, b"k", &l, &r));
        assert_ne!(inner, inner_hash(1, 2, 1, b"j", &l, &r));
    }

    #[test]
    fn test_encode_decode_verifies_hash() {
        let leaf = Node::leaf(b"a".to_vec(), b"1".to_vec(), 3);
        let bytes = leaf.encode().unwrap();
        let decoded = Node::decode(&leaf.hash(), &bytes).unwrap();
        assert_eq!(decoded, leaf);

        let inner = Node::inner(1, 2, 3, b"b".to_vec(), leaf.hash(), Hash::digest(b"x"));
        let bytes = inner.encode().unwrap();
        let decoded = Node::decode(&inner.hash(), &bytes).unwrap();
        assert_eq!(decoded.children(), inner.children());
        assert_eq!(decoded.key(), b"b");
    }

    #[test]
    fn test_decode_rejects_wrong_address() {
        let leaf = Node::leaf(b"a".to_vec(), b"1".to_vec(), 3);
        let bytes = leaf.encode().unwrap();
        let err = Node::decode(&Hash::digest(b"elsewhere"), &bytes).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = Node::decode(&Hash::digest(b"x"), &[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
