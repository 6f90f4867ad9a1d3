//! Keys accepted by `get`, decided once at the engine boundary

use crate::model::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A lookup key: either a content digest or an arbitrary associative key.
///
/// Strings of exactly 64 hex characters, in either case, become
/// [`Key::Digest`]; every other string and every byte buffer becomes
/// [`Key::Raw`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    Digest(Digest),
    Raw(Vec<u8>),
}

impl Key {
    fn classify(s: &str) -> Option<Digest> {
        if Digest::is_digest_shaped(s) {
            Digest::from_hex(s).ok()
        } else {
            None
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        match Key::classify(s) {
            Some(d) => Key::Digest(d),
            None => Key::Raw(s.as_bytes().to_vec()),
        }
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        match Key::classify(&s) {
            Some(d) => Key::Digest(d),
            None => Key::Raw(s.into_bytes()),
        }
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::from(s.as_str())
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::Raw(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Raw(bytes)
    }
}

impl From<Digest> for Key {
    fn from(d: Digest) -> Self {
        Key::Digest(d)
    }
}

/// BLAKE3 hash of an associative key, used as the index key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn of(key: &[u8]) -> Self {
        KeyHash(*blake3::hash(key).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        KeyHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", &hex::encode(self.0)[..12])
    }
}
