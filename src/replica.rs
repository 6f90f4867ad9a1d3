//! Synchronous, all-or-nothing mirroring of the primary arena
//!
//! Every commit is planned once against the primary and applied byte for
//! byte to the primary and then to each replica, so all files keep the same
//! layout. If any replica cannot take the write, every file already written
//! is reverted and the indexes are left untouched.

use crate::arena::{encode_record, record_len, Arena, RecordKind, Undo};
use crate::index::snapshot;
use crate::model::{Digest, KeyHash};
use crate::volume::Volume;
use crate::{Error, Result};
use tracing::{debug, info, warn};

/// A single mutation of the store
#[derive(Clone, Copy, Debug)]
pub enum WriteOp<'a> {
    /// A compressed content object
    Object {
        digest: Digest,
        original_len: u32,
        stored: &'a [u8],
    },
    /// A key with its compressed value
    Association {
        key: &'a [u8],
        original_len: u32,
        stored: &'a [u8],
    },
}

impl WriteOp<'_> {
    pub fn kind(&self) -> RecordKind {
        match self {
            WriteOp::Object { .. } => RecordKind::Object,
            WriteOp::Association { .. } => RecordKind::Association,
        }
    }

    pub fn id(&self) -> [u8; 32] {
        match self {
            WriteOp::Object { digest, .. } => *digest.as_bytes(),
            WriteOp::Association { key, .. } => *KeyHash::of(key).as_bytes(),
        }
    }

    /// Encode as an arena record
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (key, original_len, stored): (&[u8], u32, &[u8]) = match *self {
            WriteOp::Object {
                original_len,
                stored,
                ..
            } => (b"", original_len, stored),
            WriteOp::Association {
                key,
                original_len,
                stored,
            } => (key, original_len, stored),
        };

        let len = record_len(key.len(), stored.len());
        if len > u32::MAX as u64 {
            return Err(Error::Capacity {
                requested: len,
                capacity: u32::MAX as u64,
            });
        }
        Ok(encode_record(self.kind(), self.id(), key, original_len, stored))
    }
}

/// Outcome of a commit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Commit {
    /// Logical offset of the record in every file
    pub offset: u64,
    /// False when an identical object was already present
    pub written: bool,
    /// Records evicted to make room
    pub evicted: usize,
}

/// The primary volume and its mirrors
pub struct ReplicaSet {
    primary: Volume,
    replicas: Vec<Arena>,
    sync_writes: bool,
}

impl ReplicaSet {
    /// Pair `primary` with `replicas`, resynchronizing any replica that differs.
    ///
    /// A replica's own sidecar index is deleted: its bytes now follow the
    /// primary, and nothing refreshes that sidecar while it is a copy.
    pub fn open(primary: Volume, replicas: Vec<Arena>, sync_writes: bool) -> Result<Self> {
        {
            let _gate = primary.lock_gate();
            let _lock = primary.arena().lock_exclusive()?;
            let expected = primary.arena().read_header()?;

            for replica in &replicas {
                if replica.path() == primary.arena().path() {
                    return Err(Error::Init(format!(
                        "'{}' is both the storage file and a copy",
                        replica.path().display()
                    )));
                }
                if replica.capacity() != expected.capacity {
                    return Err(Error::Init(format!(
                        "Copy '{}' has capacity {}, storage file has {}",
                        replica.path().display(),
                        replica.capacity(),
                        expected.capacity
                    )));
                }

                let in_sync = matches!(replica.read_header(), Ok(h) if h == expected);
                if !in_sync {
                    info!(
                        replica = %replica.path().display(),
                        primary = %primary.arena().path().display(),
                        "resynchronizing copy from storage file"
                    );
                    replica.copy_image_from(primary.arena())?;
                    replica.flush()?;
                }
                snapshot::remove(replica.path())?;
            }
        }

        Ok(ReplicaSet {
            primary,
            replicas,
            sync_writes,
        })
    }

    pub fn primary(&self) -> &Volume {
        &self.primary
    }

    pub fn replicas(&self) -> &[Arena] {
        &self.replicas
    }

    /// Apply `op` to every file, or to none of them
    pub fn commit(&self, op: &WriteOp<'_>) -> Result<Commit> {
        let arena = self.primary.arena();
        let _gate = self.primary.lock_gate();
        let _lock = arena.lock_exclusive()?;
        let mut index = self.primary.write_index();
        self.primary.catch_up(&mut index)?;

        if let WriteOp::Object { digest, .. } = op {
            if let Some(offset) = index.objects.get(digest) {
                return Ok(Commit {
                    offset,
                    written: false,
                    evicted: 0,
                });
            }
        }

        let record = op.encode()?;
        let placement = arena.plan(index.state, record.len() as u64)?;

        let mut applied: Vec<(&Arena, Undo)> = Vec::with_capacity(1 + self.replicas.len());
        applied.push((arena, arena.apply(&placement, &record)?));

        for replica in &self.replicas {
            let mirrored = match replica.state() {
                Ok(state) if state == placement.before => replica.apply(&placement, &record),
                Ok(state) => Err(Error::Corruption(format!(
                    "copy diverged from storage file (tail {} vs {}, generation {} vs {})",
                    state.tail, placement.before.tail, state.generation, placement.before.generation
                ))),
                Err(e) => Err(e),
            };
            match mirrored {
                Ok(undo) => applied.push((replica, undo)),
                Err(e) => {
                    Self::rollback(applied);
                    warn!(replica = %replica.path().display(), error = %e, "copy rejected write, rolled back");
                    return Err(Error::Replication {
                        path: replica.path().to_path_buf(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if self.sync_writes {
            let failed = applied
                .iter()
                .enumerate()
                .find_map(|(i, (a, _))| a.flush().err().map(|e| (i, a.path().to_path_buf(), e)));
            if let Some((i, path, e)) = failed {
                Self::rollback(applied);
                return Err(if i == 0 {
                    e
                } else {
                    Error::Replication {
                        path,
                        reason: e.to_string(),
                    }
                });
            }
        }

        for evicted in &placement.evicted {
            index.evict(evicted);
        }
        index.insert(placement.offset, op.kind(), op.id());
        index.state = placement.after;

        debug!(
            kind = ?op.kind(),
            offset = placement.offset,
            len = placement.len,
            evicted = placement.evicted.len(),
            copies = self.replicas.len(),
            "committed"
        );

        Ok(Commit {
            offset: placement.offset,
            written: true,
            evicted: placement.evicted.len(),
        })
    }

    /// Flush the primary and every replica
    pub fn flush(&self) -> Result<()> {
        self.primary.arena().flush()?;
        for replica in &self.replicas {
            replica.flush()?;
        }
        Ok(())
    }

    fn rollback(applied: Vec<(&Arena, Undo)>) {
        for (arena, undo) in applied.into_iter().rev() {
            if let Err(e) = arena.revert(undo) {
                warn!(path = %arena.path().display(), error = %e, "failed to revert write");
            }
        }
    }
}

impl std::fmt::Debug for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("primary", &self.primary)
            .field("replicas", &self.replicas)
            .finish()
    }
}
