//! Error types for iavl_db

use crate::model::Hash;
use thiserror::Error;

/// Result type alias for iavl_db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in iavl_db operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A node referenced by a live tree is missing from the store
    #[error("Node not found: {0}")]
    NodeNotFound(Hash),

    #[error("Version not found: {0}")]
    VersionNotFound(u64),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Version {version} was already saved with root {expected}, working root is {found}")]
    VersionConflict {
        version: u64,
        expected: Hash,
        found: Hash,
    },

    #[error("Invalid database file: {0}")]
    InvalidFile(String),

    #[error("Format version mismatch: expected {expected}, found {found}")]
    FormatVersionMismatch { expected: u32, found: u32 },

    #[error("Import error: {0}")]
    Import(String),

    #[error("Config error: {0}")]
    Config(String),
}
