//! # instadb
//!
//! An embeddable, disk-backed, content-addressed object store with an
//! associative key-value index.
//!
//! Each storage file is a fixed-size, memory-mapped ring of records. Blobs
//! are addressed by the SHA-256 of their bytes and stored zstd-compressed,
//! so identical payloads are kept once. When a file fills up, the oldest
//! records are evicted.
//!
//! ## Core Concepts
//!
//! - **Objects**: content-addressed, deduplicated blobs
//! - **Associations**: caller keys mapped to values, last write wins
//! - **Copies**: replica files mirrored synchronously, all or nothing
//! - **Read-only files**: overlays searched after the primary on a miss
//!
//! ## Example
//!
//! ```ignore
//! use instadb::{Config, Engine};
//!
//! let db = Engine::open(Config::new("store.db", 16 << 20))?;
//! let digest = db.store(b"hello")?;
//! assert_eq!(&db.fetch(&digest, true)?.unwrap()[..], b"hello");
//! db.associate(b"greeting", b"hello")?;
//! ```

pub mod arena;
pub mod codec;
pub mod config;
pub mod index;
pub mod model;
pub mod overlay;
pub mod replica;
pub mod volume;

mod engine;
mod error;
mod flat;

pub use arena::{MAGIC, VERSION};
pub use codec::Codec;
pub use config::{decode_file_list, encode_file_list, Config, ConfigBuilder};
pub use engine::{Engine, Stats};
pub use error::{Error, Result};
pub use flat::FlatView;
pub use model::{Digest, Key, KeyHash};
