//! Persisted copy of an arena's indexes
//!
//! Written next to the arena as `<file>.idx` on close. It is trusted only
//! when the capacity, image id, cursors and generation it recorded still
//! match the arena header; otherwise the arena is rescanned.

use crate::arena::{ArenaHeader, ArenaState};
use crate::index::IndexSet;
use crate::model::{Digest, KeyHash};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    capacity: u64,
    image_id: u64,
    head: u64,
    tail: u64,
    generation: u64,
    records: u64,
    objects: Vec<(Digest, u64)>,
    associations: Vec<(KeyHash, u64)>,
}

/// Location of the sidecar index for an arena file
pub fn sidecar_path(arena_path: &Path) -> PathBuf {
    let mut name = arena_path.as_os_str().to_owned();
    name.push(".idx");
    PathBuf::from(name)
}

/// Write `index` to the sidecar of `arena_path`
pub fn save(arena_path: &Path, capacity: u64, image_id: u64, index: &IndexSet) -> Result<()> {
    let mut objects: Vec<_> = index.objects.iter().map(|(d, o)| (*d, *o)).collect();
    objects.sort_by_key(|(_, offset)| *offset);
    let mut associations: Vec<_> = index.associations.iter().map(|(k, o)| (*k, *o)).collect();
    associations.sort_by_key(|(_, offset)| *offset);

    let snapshot = IndexSnapshot {
        version: SNAPSHOT_VERSION,
        capacity,
        image_id,
        head: index.state.head,
        tail: index.state.tail,
        generation: index.state.generation,
        records: index.state.records,
        objects,
        associations,
    };

    let path = sidecar_path(arena_path);
    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        bincode::serialize_into(&mut writer, &snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Delete the sidecar of `arena_path`, if there is one
pub fn remove(arena_path: &Path) -> Result<()> {
    match fs::remove_file(sidecar_path(arena_path)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Load the sidecar of `arena_path` if it matches `header`
pub fn load(arena_path: &Path, header: &ArenaHeader) -> Result<Option<IndexSet>> {
    let path = sidecar_path(arena_path);
    if !path.exists() {
        return Ok(None);
    }

    let reader = BufReader::new(fs::File::open(&path)?);
    let snapshot: IndexSnapshot = bincode::deserialize_from(reader)?;

    let state = ArenaState {
        head: snapshot.head,
        tail: snapshot.tail,
        generation: snapshot.generation,
        records: snapshot.records,
    };
    if snapshot.version != SNAPSHOT_VERSION
        || snapshot.capacity != header.capacity
        || snapshot.image_id != header.image_id
        || state != header.state
    {
        return Ok(None);
    }

    let mut index = IndexSet::new(state);
    for (digest, offset) in snapshot.objects {
        index.objects.put(digest, offset);
    }
    for (key, offset) in snapshot.associations {
        index.associations.put(key, offset);
    }
    Ok(Some(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> IndexSet {
        let mut index = IndexSet::new(ArenaState {
            head: 0,
            tail: 256,
            generation: 2,
            records: 2,
        });
        index.objects.put(Digest::of(b"one"), 0);
        index.associations.put(KeyHash::of(b"k"), 128);
        index
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let arena = dir.path().join("a.db");
        let index = sample();
        save(&arena, 4096, 7, &index).unwrap();

        let header = ArenaHeader {
            capacity: 4096,
            image_id: 7,
            state: index.state,
        };
        let loaded = load(&arena, &header).unwrap().unwrap();
        assert_eq!(loaded.objects.get(&Digest::of(b"one")), Some(0));
        assert_eq!(loaded.associations.get(&KeyHash::of(b"k")), Some(128));
        assert_eq!(loaded.state, index.state);
    }

    #[test]
    fn test_stale_sidecar_is_ignored() {
        let dir = tempdir().unwrap();
        let arena = dir.path().join("a.db");
        let index = sample();
        save(&arena, 4096, 7, &index).unwrap();

        let mut header = ArenaHeader {
            capacity: 4096,
            image_id: 7,
            state: index.state,
        };
        header.state.generation += 1;
        assert!(load(&arena, &header).unwrap().is_none());
    }

    #[test]
    fn test_missing_sidecar() {
        let dir = tempdir().unwrap();
        let header = ArenaHeader::new(4096, 7);
        assert!(load(&dir.path().join("a.db"), &header).unwrap().is_none());
    }

    #[test]
    fn test_sidecar_of_another_image_is_ignored() {
        let dir = tempdir().unwrap();
        let arena = dir.path().join("a.db");
        let index = sample();
        save(&arena, 4096, 7, &index).unwrap();

        // Same capacity and cursors, but a different image
        let header = ArenaHeader {
            capacity: 4096,
            image_id: 8,
            state: index.state,
        };
        assert!(load(&arena, &header).unwrap().is_none());
    }

    #[test]
    fn test_remove_sidecar() {
        let dir = tempdir().unwrap();
        let arena = dir.path().join("a.db");
        remove(&arena).unwrap();

        save(&arena, 4096, 7, &sample()).unwrap();
        assert!(sidecar_path(&arena).exists());
        remove(&arena).unwrap();
        assert!(!sidecar_path(&arena).exists());
    }
}
