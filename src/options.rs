//! Tree options
//!
//! Read from `~/.config/iavl/options.json` by the CLI; every field is
//! optional in the file and falls back to its default.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options controlling caching, versioning and pruning of a [`MutableTree`](crate::MutableTree)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Node cache capacity in nodes; 0 disables the cache
    pub cache_size: usize,
    /// Version assigned to the first commit of an empty store
    pub initial_version: u64,
    /// When set, committing without pending writes does not create a version
    pub skip_empty_versions: bool,
    /// Keep only this many most recent versions, pruning older ones after each commit
    pub keep_recent: Option<u64>,
    /// fsync the backing file after every commit
    pub sync_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cache_size: 10_000,
            initial_version: 1,
            skip_empty_versions: false,
            keep_recent: None,
            sync_writes: true,
        }
    }
}

impl Options {
    /// Default options file location (~/.config/iavl/options.json)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".into()))?;
        Ok(config_dir.join("iavl").join("options.json"))
    }

    /// Load options from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Options::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let options: Options = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Write options as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_version == 0 {
            return Err(Error::Config("initial_version must be at least 1".into()));
        }
        if self.keep_recent == Some(0) {
            return Err(Error::Config("keep_recent must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_initial_version(mut self, version: u64) -> Self {
        self.initial_version = version;
        self
    }

    pub fn with_skip_empty_versions(mut self, skip: bool) -> Self {
        self.skip_empty_versions = skip;
        self
    }

    pub fn with_keep_recent(mut self, keep: u64) -> Self {
        self.keep_recent = Some(keep);
        self
    }
}
