//! High-level store API
//!
//! This module provides the main entry point for interacting with instadb.

use crate::arena::{Arena, Record};
use crate::codec::Codec;
use crate::config::Config;
use crate::flat::FlatView;
use crate::model::{Digest, Key};
use crate::overlay::OverlayChain;
use crate::replica::{ReplicaSet, WriteOp};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// The main store interface
///
/// Provides:
/// - Content-addressed `store` / `fetch` with deduplication
/// - Key-value `associate` / `get`
/// - Fallback to read-only overlay files on a miss
/// - Synchronous mirroring to copies
///
/// An `Engine` is `Send + Sync`; share it behind an `Arc` for use from
/// several threads.
pub struct Engine {
    config: Config,
    inner: RwLock<Option<Inner>>,
}

struct Inner {
    replicas: ReplicaSet,
    overlays: OverlayChain,
    codec: Codec,
}

/// Snapshot of the primary file's occupancy
#[derive(Clone, Debug, Serialize)]
pub struct Stats {
    pub storage_file: PathBuf,
    pub capacity: u64,
    pub used_bytes: u64,
    pub records: u64,
    pub objects: usize,
    pub associations: usize,
    pub generation: u64,
    pub copies: usize,
    pub read_only_files: usize,
}

impl Engine {
    /// Open the primary, its copies and the read-only files
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let primary = Arena::open(&config.storage_file, config.size)?;
        let primary = crate::volume::Volume::open(primary, config.persist_index)?;

        let copies = config
            .storage_copies
            .iter()
            .map(|path| Arena::open(path, config.size))
            .collect::<Result<Vec<_>>>()?;
        let replicas = ReplicaSet::open(primary, copies, config.sync_writes)?;

        let overlays = OverlayChain::open(&config.read_only_files, config.persist_index)?;

        let stats = replicas.primary().stats()?;
        info!(
            storage_file = %config.storage_file.display(),
            size = config.size,
            copies = config.storage_copies.len(),
            read_only_files = overlays.len(),
            objects = stats.objects,
            associations = stats.associations,
            "opened store"
        );

        Ok(Engine {
            inner: RwLock::new(Some(Inner {
                replicas,
                overlays,
                codec: Codec::new(config.compression_level),
            })),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().is_none()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&Inner) -> Result<T>) -> Result<T> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(Error::Closed)?;
        f(inner)
    }

    // === Content objects ===

    /// Store `data`, returning its digest as 64 lowercase hex characters.
    ///
    /// An empty payload is not stored and yields an empty string.
    pub fn store(&self, data: &[u8]) -> Result<String> {
        self.with_inner(|inner| {
            if data.is_empty() {
                return Ok(String::new());
            }

            let digest = Digest::of(data);
            let primary = inner.replicas.primary();
            if inner.overlays.contains_digest(primary, &digest)? {
                debug!(digest = %digest.short(), "already stored");
                return Ok(digest.to_hex());
            }

            let original_len = u32::try_from(data.len()).map_err(|_| Error::Capacity {
                requested: data.len() as u64,
                capacity: self.config.size,
            })?;
            let stored = inner.codec.compress(data)?;
            inner.replicas.commit(&WriteOp::Object {
                digest,
                original_len,
                stored: &stored,
            })?;
            Ok(digest.to_hex())
        })
    }

    /// Fetch an object by its hex digest.
    ///
    /// With `decompress` false the stored zstd frame is returned as is. A
    /// string that is not a digest names no object and reads as absent.
    pub fn fetch(&self, digest_hex: &str, decompress: bool) -> Result<Option<Bytes>> {
        match Digest::from_hex(digest_hex) {
            Ok(digest) => self.fetch_digest(&digest, decompress),
            Err(_) => self.with_inner(|_| {
                debug!(digest = digest_hex, "not a digest");
                Ok(None)
            }),
        }
    }

    /// [`Engine::fetch`] decoded as lossy UTF-8
    pub fn fetch_string(&self, digest_hex: &str) -> Result<Option<String>> {
        Ok(self.fetch(digest_hex, true)?.map(lossy_string))
    }

    /// The stored zstd frame of an object
    pub fn fetch_compressed(&self, digest_hex: &str) -> Result<Option<Bytes>> {
        self.fetch(digest_hex, false)
    }

    pub fn fetch_digest(&self, digest: &Digest, decompress: bool) -> Result<Option<Bytes>> {
        self.with_inner(|inner| {
            match inner
                .overlays
                .lookup_digest(inner.replicas.primary(), digest)?
            {
                Some(record) => Ok(Some(inner.payload(record, decompress)?)),
                None => Ok(None),
            }
        })
    }

    /// Whether an object with `digest` is reachable
    pub fn contains(&self, digest: &Digest) -> Result<bool> {
        self.with_inner(|inner| {
            inner
                .overlays
                .contains_digest(inner.replicas.primary(), digest)
        })
    }

    // === Associations ===

    /// Associate `value` with `key`, replacing any earlier value.
    ///
    /// Returns false, without writing, when `key` is empty. An empty
    /// `value` hides the key from [`Engine::get`].
    pub fn associate(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.with_inner(|inner| {
            if key.is_empty() {
                return Ok(false);
            }

            let original_len = u32::try_from(value.len()).map_err(|_| Error::Capacity {
                requested: value.len() as u64,
                capacity: self.config.size,
            })?;
            let stored = inner.codec.compress(value)?;
            inner.replicas.commit(&WriteOp::Association {
                key,
                original_len,
                stored: &stored,
            })?;
            Ok(true)
        })
    }

    /// Look up a key: digests resolve like [`Engine::fetch`], anything else
    /// through the associations.
    pub fn get(&self, key: impl Into<Key>, decompress: bool) -> Result<Option<Bytes>> {
        match key.into() {
            Key::Digest(digest) => self.fetch_digest(&digest, decompress),
            Key::Raw(key) => self.with_inner(|inner| {
                match inner.overlays.lookup_key(inner.replicas.primary(), &key)? {
                    Some(record) => Ok(Some(inner.payload(record, decompress)?)),
                    None => Ok(None),
                }
            }),
        }
    }

    /// [`Engine::get`] decoded as lossy UTF-8
    pub fn get_string(&self, key: impl Into<Key>) -> Result<Option<String>> {
        Ok(self.get(key, true)?.map(lossy_string))
    }

    /// The stored zstd frame behind [`Engine::get`]
    pub fn get_compressed(&self, key: impl Into<Key>) -> Result<Option<Bytes>> {
        self.get(key, false)
    }

    /// Property-style access over [`Engine::get`] and [`Engine::associate`]
    pub fn flat(&self) -> FlatView<'_> {
        FlatView::new(self)
    }

    pub fn stats(&self) -> Result<Stats> {
        self.with_inner(|inner| {
            let primary = inner.replicas.primary();
            let stats = primary.stats()?;
            Ok(Stats {
                storage_file: self.config.storage_file.clone(),
                capacity: primary.arena().capacity(),
                used_bytes: stats.state.used(),
                records: stats.state.records,
                objects: stats.objects,
                associations: stats.associations,
                generation: stats.state.generation,
                copies: inner.replicas.replicas().len(),
                read_only_files: inner.overlays.len(),
            })
        })
    }

    /// Flush every file and release all handles.
    ///
    /// Later operations fail with [`Error::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(inner) = self.inner.write().take() else {
            return Ok(());
        };

        inner.replicas.flush()?;
        if self.config.persist_index {
            inner.replicas.primary().persist_index()?;
        }
        info!(storage_file = %self.config.storage_file.display(), "closed store");
        Ok(())
    }
}

impl Inner {
    fn payload(&self, record: Record, decompress: bool) -> Result<Bytes> {
        if decompress {
            let data = self
                .codec
                .decompress(&record.stored, record.original_len as usize)?;
            Ok(Bytes::from(data))
        } else {
            Ok(Bytes::from(record.stored))
        }
    }
}

fn lossy_string(bytes: Bytes) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Best-effort close on drop
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close store cleanly");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("storage_file", &self.config.storage_file)
            .field("closed", &self.is_closed())
            .finish()
    }
}
