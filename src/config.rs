//! Configuration for an instadb store
//!
//! The recognized options mirror the ones the store has always taken:
//! `storage_file`, `storage_copies`, `read_only_files` and `size`. A config
//! can be built in code, through [`ConfigBuilder`], or loaded from JSON.

use crate::arena::MIN_CAPACITY;
use crate::codec::DEFAULT_LEVEL;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options for opening an [`crate::Engine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Primary arena, created if absent
    pub storage_file: PathBuf,

    /// Replicas, written synchronously in this order
    #[serde(default)]
    pub storage_copies: Vec<PathBuf>,

    /// Read-only overlays, searched in this order; must already exist
    #[serde(default)]
    pub read_only_files: Vec<PathBuf>,

    /// Capacity in bytes of the primary and of every replica
    pub size: u64,

    /// zstd level for stored payloads
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// msync every file after each commit
    #[serde(default)]
    pub sync_writes: bool,

    /// Keep a `<file>.idx` sidecar so reopening skips the scan
    #[serde(default = "default_persist_index")]
    pub persist_index: bool,
}

fn default_compression_level() -> i32 {
    DEFAULT_LEVEL
}

fn default_persist_index() -> bool {
    true
}

impl Config {
    pub fn new(storage_file: impl Into<PathBuf>, size: u64) -> Self {
        Config {
            storage_file: storage_file.into(),
            storage_copies: Vec::new(),
            read_only_files: Vec::new(),
            size,
            compression_level: DEFAULT_LEVEL,
            sync_writes: false,
            persist_index: true,
        }
    }

    pub fn builder(storage_file: impl Into<PathBuf>, size: u64) -> ConfigBuilder {
        ConfigBuilder {
            config: Config::new(storage_file, size),
        }
    }

    /// Load a config from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the copy and overlay lists with ones in the framed encoding
    pub fn with_framed_lists(mut self, copies: &[u8], read_only: &[u8]) -> Result<Self> {
        self.storage_copies = decode_file_list(copies)?;
        self.read_only_files = decode_file_list(read_only)?;
        Ok(self)
    }

    /// Check the options before any file is touched
    pub fn validate(&self) -> Result<()> {
        if self.storage_file.as_os_str().is_empty() {
            return Err(Error::Config("storage_file must be set".into()));
        }
        if self.size < MIN_CAPACITY {
            return Err(Error::Config(format!(
                "size must be at least {} bytes, got {}",
                MIN_CAPACITY, self.size
            )));
        }
        if self.storage_copies.iter().any(|p| p == &self.storage_file) {
            return Err(Error::Config(
                "storage_copies must not contain storage_file".into(),
            ));
        }
        if self.read_only_files.iter().any(|p| p == &self.storage_file) {
            return Err(Error::Config(
                "read_only_files must not contain storage_file".into(),
            ));
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "compression_level {} is outside zstd's range",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Add a replica path
    pub fn copy(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_copies.push(path.into());
        self
    }

    /// Add a read-only overlay path
    pub fn read_only(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.read_only_files.push(path.into());
        self
    }

    pub fn compression_level(mut self, level: i32) -> Self {
        self.config.compression_level = level;
        self
    }

    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.config.sync_writes = sync;
        self
    }

    pub fn persist_index(mut self, persist: bool) -> Self {
        self.config.persist_index = persist;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// List framing
// =============================================================================

/// Encode paths as `"<count>\0<item1>\0...\0<itemN>\0" + "0\0"`
pub fn encode_file_list(paths: &[PathBuf]) -> Vec<u8> {
    let items: Vec<String> = paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    format!("{}\0{}\0{}\0", items.len(), items.join("\0"), 0).into_bytes()
}

/// Decode a list produced by [`encode_file_list`]
pub fn decode_file_list(frame: &[u8]) -> Result<Vec<PathBuf>> {
    let mut tokens: Vec<&[u8]> = frame.split(|&b| b == 0).collect();
    if tokens.last().is_some_and(|t| t.is_empty()) {
        tokens.pop();
    }

    let count: usize = tokens
        .first()
        .and_then(|t| std::str::from_utf8(t).ok())
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| Error::Config("file list does not start with a count".into()))?;

    if tokens.len() < count + 2 {
        return Err(Error::Config(format!(
            "file list declares {} entries but is truncated",
            count
        )));
    }

    let items = &tokens[1..=count];
    let rest: Vec<&[u8]> = tokens[count + 1..]
        .iter()
        .copied()
        .filter(|t| !t.is_empty())
        .collect();
    if rest != [b"0".as_slice()] {
        return Err(Error::Config("file list is missing its terminator".into()));
    }

    Ok(items
        .iter()
        .filter(|item| !item.is_empty())
        .map(|item| PathBuf::from(String::from_utf8_lossy(item).into_owned()))
        .collect())
}
