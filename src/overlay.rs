//! Read-only storage files consulted after the primary misses

use crate::arena::{Arena, Record};
use crate::model::Digest;
use crate::volume::{Association, Volume};
use crate::Result;
use std::path::PathBuf;
use tracing::debug;

/// Ordered read-only volumes behind the primary
#[derive(Debug, Default)]
pub struct OverlayChain {
    overlays: Vec<Volume>,
}

impl OverlayChain {
    /// Open every overlay read-only, in order; each must already exist
    pub fn open(paths: &[PathBuf], use_sidecar: bool) -> Result<Self> {
        let overlays = paths
            .iter()
            .map(|path| {
                let volume = Volume::open(Arena::open_read_only(path)?, use_sidecar)?;
                debug!(path = %path.display(), capacity = volume.arena().capacity(), "opened read-only file");
                Ok(volume)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(OverlayChain { overlays })
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.overlays
    }

    /// First object with `digest`, looking in `primary` and then each overlay
    pub fn lookup_digest(&self, primary: &Volume, digest: &Digest) -> Result<Option<Record>> {
        for volume in std::iter::once(primary).chain(&self.overlays) {
            if let Some(record) = volume.find_object(digest)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Latest value for `key` in the first volume that knows the key.
    /// A tombstone in an earlier volume hides later ones.
    pub fn lookup_key(&self, primary: &Volume, key: &[u8]) -> Result<Option<Record>> {
        for volume in std::iter::once(primary).chain(&self.overlays) {
            match volume.find_association(key)? {
                Some(Association::Value(record)) => return Ok(Some(record)),
                Some(Association::Tombstone) => return Ok(None),
                None => continue,
            }
        }
        Ok(None)
    }

    pub fn contains_digest(&self, primary: &Volume, digest: &Digest) -> Result<bool> {
        for volume in std::iter::once(primary).chain(&self.overlays) {
            if volume.contains(digest)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
