//! Error types for instadb

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for instadb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in instadb operations
///
/// "Not found" is never an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store could not be opened as configured
    #[error("Init error: {0}")]
    Init(String),

    /// A single record does not fit in the arena
    #[error("Capacity error: record of {requested} bytes exceeds arena capacity of {capacity} bytes")]
    Capacity { requested: u64, capacity: u64 },

    #[error("Codec error: {0}")]
    Codec(String),

    /// A replica rejected the write; nothing was applied anywhere
    #[error("Replication error on {}: {reason}", path.display())]
    Replication { path: PathBuf, reason: String },

    #[error("Store is closed")]
    Closed,

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Config error: {0}")]
    Config(String),
}
