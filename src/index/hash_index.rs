//! Digest → location index for content objects

use crate::model::Digest;
use std::collections::HashMap;

/// Maps content digests to the logical offset of their record
#[derive(Debug, Default, Clone)]
pub struct HashIndex {
    entries: HashMap<Digest, u64>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, digest: Digest, location: u64) {
        self.entries.insert(digest, location);
    }

    pub fn get(&self, digest: &Digest) -> Option<u64> {
        self.entries.get(digest).copied()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.contains_key(digest)
    }

    /// Drop `digest` only if it still points at `location`
    pub fn remove_if(&mut self, digest: &Digest, location: u64) -> bool {
        if self.entries.get(digest) == Some(&location) {
            self.entries.remove(digest);
            true
        } else {
            false
        }
    }

    /// Drop every entry below the arena head
    pub fn retain_from(&mut self, head: u64) {
        self.entries.retain(|_, loc| *loc >= head);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Digest, &u64)> {
        self.entries.iter()
    }
}
