//! In-memory indexes over an arena
//!
//! Both indexes are caches: they can always be rebuilt by scanning the
//! arena, and may be persisted next to it so reopening skips the scan.

mod assoc_index;
mod hash_index;
pub mod snapshot;

pub use assoc_index::AssociativeIndex;
pub use hash_index::HashIndex;

use crate::arena::{ArenaState, Evicted, RecordHeader, RecordKind};
use crate::model::{Digest, KeyHash};

/// Both indexes of one arena, and the arena state they reflect
#[derive(Debug, Default, Clone)]
pub struct IndexSet {
    pub objects: HashIndex,
    pub associations: AssociativeIndex,
    pub state: ArenaState,
}

impl IndexSet {
    pub fn new(state: ArenaState) -> Self {
        IndexSet {
            state,
            ..Default::default()
        }
    }

    /// Index a record found at `offset`
    pub fn insert(&mut self, offset: u64, kind: RecordKind, id: [u8; 32]) {
        match kind {
            RecordKind::Object => self.objects.put(Digest::from_bytes(id), offset),
            RecordKind::Association => {
                self.associations.put(KeyHash::from_bytes(id), offset);
            }
            RecordKind::Padding => {}
        }
    }

    pub fn insert_header(&mut self, offset: u64, header: &RecordHeader) {
        self.insert(offset, header.kind, header.id);
    }

    /// Forget an evicted record, unless a newer record took over its id
    pub fn evict(&mut self, evicted: &Evicted) {
        match evicted.kind {
            RecordKind::Object => {
                self.objects
                    .remove_if(&Digest::from_bytes(evicted.id), evicted.offset);
            }
            RecordKind::Association => {
                self.associations
                    .remove_if(&KeyHash::from_bytes(evicted.id), evicted.offset);
            }
            RecordKind::Padding => {}
        }
    }

    /// Drop everything that now lies below `head`
    pub fn retain_from(&mut self, head: u64) {
        self.objects.retain_from(head);
        self.associations.retain_from(head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_evict_by_kind() {
        let mut set = IndexSet::new(ArenaState::default());
        let d = Digest::of(b"obj");
        let k = KeyHash::of(b"key");
        set.insert(0, RecordKind::Object, *d.as_bytes());
        set.insert(128, RecordKind::Association, *k.as_bytes());
        set.insert(256, RecordKind::Padding, [0u8; 32]);
        assert_eq!(set.objects.len(), 1);
        assert_eq!(set.associations.len(), 1);

        set.evict(&Evicted {
            offset: 0,
            kind: RecordKind::Object,
            id: *d.as_bytes(),
        });
        assert!(set.objects.is_empty());
        assert_eq!(set.associations.get(&k), Some(128));
    }
}
