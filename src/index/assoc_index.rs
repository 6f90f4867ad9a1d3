//! Key → location index for associations

use crate::model::KeyHash;
use std::collections::HashMap;

/// Maps hashed caller keys to the logical offset of their latest record.
///
/// Keys are never deduplicated against content: two keys holding the same
/// value point at two different records.
#[derive(Debug, Default, Clone)]
pub struct AssociativeIndex {
    entries: HashMap<KeyHash, u64>,
}

impl AssociativeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `key` at `location`, replacing any earlier association
    pub fn put(&mut self, key: KeyHash, location: u64) -> Option<u64> {
        self.entries.insert(key, location)
    }

    pub fn get(&self, key: &KeyHash) -> Option<u64> {
        self.entries.get(key).copied()
    }

    /// Drop `key` only if its latest record is the one at `location`
    pub fn remove_if(&mut self, key: &KeyHash, location: u64) -> bool {
        if self.entries.get(key) == Some(&location) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    pub fn retain_from(&mut self, head: u64) {
        self.entries.retain(|_, loc| *loc >= head);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyHash, &u64)> {
        self.entries.iter()
    }
}
