//! Core data model types for iavl_db

mod fast_node;
mod hash;
pub mod keys;
mod node;

pub use fast_node::FastNode;
pub use hash::{Hash, HASH_LEN};
pub use keys::Orphan;
pub use node::{inner_hash, leaf_hash, Node, NodeBody, HASH_FORMAT, MAX_KEY_LEN};
