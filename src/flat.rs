//! Map-like view over an engine's associations

use crate::Engine;
use bytes::Bytes;
use tracing::warn;

/// Name-based access to [`Engine::get`] and [`Engine::associate`].
///
/// Names go through the same key classification as [`Engine::get`], so a
/// name that is 64 hex characters reads the content object with that
/// digest rather than an association.
#[derive(Clone, Copy, Debug)]
pub struct FlatView<'a> {
    engine: &'a Engine,
}

impl<'a> FlatView<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        FlatView { engine }
    }

    /// Value under `name`; failures are logged and read as absent
    pub fn get(&self, name: &str) -> Option<Bytes> {
        match self.engine.get(name, true) {
            Ok(value) => value,
            Err(e) => {
                warn!(name, error = %e, "flat get failed");
                None
            }
        }
    }

    /// Value under `name` as lossy UTF-8
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|value| String::from_utf8_lossy(&value).into_owned())
    }

    /// Set `name`; returns whether the write was committed
    pub fn set(&self, name: &str, value: impl AsRef<[u8]>) -> bool {
        match self.engine.associate(name.as_bytes(), value.as_ref()) {
            Ok(committed) => committed,
            Err(e) => {
                warn!(name, error = %e, "flat set failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, Engine};
    use tempfile::tempdir;

    #[test]
    fn test_flat_set_and_get() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(Config::new(dir.path().join("f.db"), 8192)).unwrap();
        let flat = engine.flat();

        assert!(flat.set("greeting", "hello"));
        assert_eq!(flat.get_string("greeting").as_deref(), Some("hello"));
        assert!(flat.get("missing").is_none());
    }

    #[test]
    fn test_flat_after_close() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(Config::new(dir.path().join("f.db"), 8192)).unwrap();
        engine.close().unwrap();

        let flat = engine.flat();
        assert!(!flat.set("k", "v"));
        assert!(flat.get("k").is_none());
    }

    #[test]
    fn test_flat_oversized_value_is_refused() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(Config::new(dir.path().join("f.db"), 1024)).unwrap();
        let noise: Vec<u8> = (0..64u32)
            .flat_map(|i| crate::model::Digest::of(&i.to_le_bytes()).as_bytes().to_vec())
            .collect();
        assert!(!engine.flat().set("big", noise));
    }
}
