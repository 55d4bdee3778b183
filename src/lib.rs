//! # iavl_db
//!
//! A versioned, authenticated key-value store built on an IAVL+ tree.
//!
//! Every committed version is an immutable snapshot identified by a
//! 32-byte root hash. Versions share unchanged subtrees, old versions stay
//! readable until they are pruned, and the tree can produce compact proofs
//! that a key maps to a value (or is absent) under a given root.
//!
//! ## Core Concepts
//!
//! - **Nodes**: Content-addressed AVL nodes; leaves hold key/value pairs
//! - **Versions**: Monotonic commit counters, each with one root pointer
//! - **Orphans**: Records of when a node stopped being reachable, used for pruning
//! - **Proofs**: Hash paths from a leaf (or its neighbours) up to a root
//!
//! ## Example
//!
//! ```ignore
//! use iavl_db::{FileDb, MutableTree, Options};
//! use std::sync::Arc;
//!
//! let db = Arc::new(FileDb::open_or_create("state.iavl")?);
//! let mut tree = MutableTree::open(db, Options::default())?;
//! tree.set(b"alice".to_vec(), b"100".to_vec())?;
//! let (root, version) = tree.save_version()?;
//! ```

pub mod model;
pub mod proof;
pub mod store;
pub mod tree;

mod error;
mod node_db;
mod options;

pub use error::{Error, Result};
pub use model::{FastNode, Hash, Node, Orphan};
pub use node_db::NodeDb;
pub use options::Options;
pub use proof::{verify_absence, verify_membership, verify_proof, LeafProof, PathStep, Proof, Side};
pub use store::{FileDb, KvStore, MemDb, WriteBatch};
pub use tree::{ExportNode, Exporter, ImmutableTree, Importer, MergedIter, MutableTree, RangeIter};

/// Storage format version for file compatibility
pub const FORMAT_VERSION: u32 = 1;

/// Magic bytes for file identification
pub const MAGIC: &[u8; 8] = b"IAVL_LOG";
