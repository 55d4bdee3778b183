//! Flat index entries for the latest version
//!
//! Alongside the tree, every commit records each live key of the newest
//! version as a fast node: the value and the version that last wrote it.
//! Point reads and iteration of the latest version go straight to these
//! records instead of walking the tree from the root.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Latest value of one key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastNode {
    /// Version that last set the key
    pub version: u64,
    pub value: Vec<u8>,
}

impl FastNode {
    pub fn new(version: u64, value: Vec<u8>) -> Self {
        FastNode { version, value }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(key: &[u8], bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            Error::Corruption(format!(
                "undecodable fast node for key {}: {}",
                hex::encode(key),
                e
            ))
        })
    }
}
