//! Byte layout of the records the node database writes
//!
//! ```text
//! node:   'n' || hash(32)                               -> encoded node
//! orphan: 'o' || be64(to_version) || be64(from_version) || hash(32) -> empty
//! root:   'r' || be64(version)                          -> root hash | empty
//! fast:   'f' || key                                    -> encoded fast node
//! meta:   'm' || name                                   -> metadata value
//! ```
//!
//! Orphan keys lead with the superseding version so that a prefix scan over
//! `'o' || be64(v)` yields exactly the nodes orphaned when `v` was committed.

use super::hash::{Hash, HASH_LEN};

pub const NODE_PREFIX: u8 = b'n';
pub const ORPHAN_PREFIX: u8 = b'o';
pub const ROOT_PREFIX: u8 = b'r';
pub const FAST_PREFIX: u8 = b'f';
pub const META_PREFIX: u8 = b'm';

/// Version the fast index describes, as be64
pub const FAST_VERSION_KEY: &[u8] = b"mfast_version";

const NODE_KEY_LEN: usize = 1 + HASH_LEN;
const ORPHAN_KEY_LEN: usize = 1 + 8 + 8 + HASH_LEN;
const ROOT_KEY_LEN: usize = 1 + 8;

/// A node that was live in versions `[from_version, to_version)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Orphan {
    pub from_version: u64,
    pub to_version: u64,
    pub hash: Hash,
}

pub fn node_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(NODE_KEY_LEN);
    key.push(NODE_PREFIX);
    key.extend_from_slice(hash.as_bytes());
    key
}

pub fn parse_node_key(key: &[u8]) -> Option<Hash> {
    if key.len() != NODE_KEY_LEN || key[0] != NODE_PREFIX {
        return None;
    }
    Hash::from_slice(&key[1..])
}

pub fn orphan_key(orphan: &Orphan) -> Vec<u8> {
    let mut key = Vec::with_capacity(ORPHAN_KEY_LEN);
    key.push(ORPHAN_PREFIX);
    key.extend_from_slice(&orphan.to_version.to_be_bytes());
    key.extend_from_slice(&orphan.from_version.to_be_bytes());
    key.extend_from_slice(orphan.hash.as_bytes());
    key
}

/// Prefix shared by every orphan superseded at `to_version`
pub fn orphan_prefix(to_version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(ORPHAN_PREFIX);
    key.extend_from_slice(&to_version.to_be_bytes());
    key
}

pub fn parse_orphan_key(key: &[u8]) -> Option<Orphan> {
    if key.len() != ORPHAN_KEY_LEN || key[0] != ORPHAN_PREFIX {
        return None;
    }
    let to_version = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let from_version = u64::from_be_bytes(key[9..17].try_into().ok()?);
    let hash = Hash::from_slice(&key[17..])?;
    Some(Orphan {
        from_version,
        to_version,
        hash,
    })
}

pub fn root_key(version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ROOT_KEY_LEN);
    key.push(ROOT_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

pub fn parse_root_key(key: &[u8]) -> Option<u64> {
    if key.len() != ROOT_KEY_LEN || key[0] != ROOT_PREFIX {
        return None;
    }
    Some(u64::from_be_bytes(key[1..].try_into().ok()?))
}

pub fn fast_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(FAST_PREFIX);
    out.extend_from_slice(key);
    out
}

pub fn parse_fast_key(key: &[u8]) -> Option<&[u8]> {
    match key.split_first() {
        Some((&FAST_PREFIX, rest)) => Some(rest),
        _ => None,
    }
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// or `None` when no such key exists (all bytes are 0xff).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
