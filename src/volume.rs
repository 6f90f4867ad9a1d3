//! An arena together with the indexes built over it
//!
//! Readers take the index read lock while they copy a record out of the
//! map; commits take the write lock for as long as they touch the file, so
//! a reader sees either all of a commit or none of it. Writes made by
//! other processes are picked up by comparing the header generation with
//! the generation the indexes were built at.

use crate::arena::{Arena, ArenaState, Record, RecordKind};
use crate::index::{snapshot, IndexSet};
use crate::model::{Digest, KeyHash};
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

/// Result of resolving an associative key in one volume
#[derive(Debug)]
pub enum Association {
    /// The latest record for the key
    Value(Record),
    /// The key was last associated with an empty value
    Tombstone,
}

/// Counters describing a volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeStats {
    pub objects: usize,
    pub associations: usize,
    pub state: ArenaState,
}

pub struct Volume {
    arena: Arena,
    index: RwLock<IndexSet>,
    /// Serializes writers and catch-up within this process
    gate: Mutex<()>,
}

impl Volume {
    /// Build the indexes for `arena`, from its sidecar when that is current
    pub fn open(arena: Arena, use_sidecar: bool) -> Result<Self> {
        let index = {
            let _lock = arena.lock_shared()?;
            let header = arena.read_header()?;

            let loaded = if use_sidecar {
                match snapshot::load(arena.path(), &header) {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        warn!(path = %arena.path().display(), error = %e, "ignoring unreadable sidecar index");
                        None
                    }
                }
            } else {
                None
            };

            match loaded {
                Some(index) => {
                    debug!(path = %arena.path().display(), "loaded sidecar index");
                    index
                }
                None => Self::scan(&arena, header.state)?,
            }
        };

        debug!(
            path = %arena.path().display(),
            objects = index.objects.len(),
            associations = index.associations.len(),
            generation = index.state.generation,
            "volume ready"
        );

        Ok(Volume {
            arena,
            index: RwLock::new(index),
            gate: Mutex::new(()),
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Pick up commits made through other handles on the same file
    pub fn refresh(&self) -> Result<()> {
        if self.arena.generation() == self.index.read().state.generation {
            return Ok(());
        }
        let _gate = self.gate.lock();
        let _lock = self.arena.lock_shared()?;
        let mut index = self.index.write();
        self.catch_up(&mut index)
    }

    /// Bring `index` level with the arena header; the caller holds the file lock
    pub(crate) fn catch_up(&self, index: &mut IndexSet) -> Result<()> {
        let state = self.arena.state()?;
        if state == index.state {
            return Ok(());
        }

        if state.head > index.state.tail || state.tail < index.state.tail {
            debug!(path = %self.arena.path().display(), "rebuilding index");
            *index = Self::scan(&self.arena, state)?;
            return Ok(());
        }

        let from = index.state.tail;
        index.retain_from(state.head);
        self.arena
            .scan(from, state.tail, |offset, header| index.insert_header(offset, header))?;
        debug!(
            path = %self.arena.path().display(),
            from,
            to = state.tail,
            "caught up with external writes"
        );
        index.state = state;
        Ok(())
    }

    pub(crate) fn lock_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    pub(crate) fn write_index(&self) -> RwLockWriteGuard<'_, IndexSet> {
        self.index.write()
    }

    pub fn contains(&self, digest: &Digest) -> Result<bool> {
        self.refresh()?;
        Ok(self.index.read().objects.contains(digest))
    }

    pub fn find_object(&self, digest: &Digest) -> Result<Option<Record>> {
        self.refresh()?;
        let index = self.index.read();
        let Some(offset) = index.objects.get(digest) else {
            return Ok(None);
        };

        match self.arena.read_record(offset) {
            Ok(record) if record.kind == RecordKind::Object && record.id == *digest.as_bytes() => {
                Ok(Some(record))
            }
            Ok(_) | Err(Error::Corruption(_))
                if self.arena.generation() != index.state.generation =>
            {
                // Overwritten by another process since our last catch-up
                Ok(None)
            }
            Ok(_) => Err(Error::Corruption(format!(
                "Index entry for {} points at a different record",
                digest
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn find_association(&self, key: &[u8]) -> Result<Option<Association>> {
        self.refresh()?;
        let hash = KeyHash::of(key);
        let index = self.index.read();
        let Some(offset) = index.associations.get(&hash) else {
            return Ok(None);
        };

        match self.arena.read_record(offset) {
            Ok(record)
                if record.kind == RecordKind::Association && record.id == *hash.as_bytes() =>
            {
                if record.key != key {
                    return Ok(None);
                }
                if record.original_len == 0 {
                    Ok(Some(Association::Tombstone))
                } else {
                    Ok(Some(Association::Value(record)))
                }
            }
            Ok(_) | Err(Error::Corruption(_))
                if self.arena.generation() != index.state.generation =>
            {
                Ok(None)
            }
            Ok(_) => Err(Error::Corruption(format!(
                "Index entry for {:?} points at a different record",
                hash
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn stats(&self) -> Result<VolumeStats> {
        self.refresh()?;
        let index = self.index.read();
        Ok(VolumeStats {
            objects: index.objects.len(),
            associations: index.associations.len(),
            state: index.state,
        })
    }

    /// Write the sidecar index for this volume
    pub fn persist_index(&self) -> Result<()> {
        let index = self.index.read();
        let header = self.arena.read_header()?;
        snapshot::save(self.arena.path(), header.capacity, header.image_id, &index)
    }

    fn scan(arena: &Arena, state: ArenaState) -> Result<IndexSet> {
        let mut index = IndexSet::new(state);
        arena.scan(state.head, state.tail, |offset, header| {
            index.insert_header(offset, header)
        })?;
        Ok(index)
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume").field("arena", &self.arena).finish()
    }
}
