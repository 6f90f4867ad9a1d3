//! Engine Integration Tests
//!
//! End-to-end behaviour of the public API over real storage files.
//!
//! Run with:
//! ```bash
//! cargo test --test engine_integration
//! ```

use instadb::{Config, Digest, Engine, Error};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

/// Bytes zstd cannot shrink: concatenated SHA-256 digests
fn noise(len: usize) -> Vec<u8> {
    (0u32..)
        .flat_map(|i| Digest::of(&i.to_le_bytes()).as_bytes().to_vec())
        .take(len)
        .collect()
}

// ============================================================================
// Content objects
// ============================================================================

#[test]
fn test_store_fetch_round_trip() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 1 << 20)).unwrap();

    let payloads: Vec<Vec<u8>> = vec![
        b"a".to_vec(),
        b"hello world".to_vec(),
        b"repeat ".repeat(500),
        noise(3000),
    ];
    for data in &payloads {
        let digest = engine.store(data).unwrap();
        assert_eq!(digest, Digest::of(data).to_hex());
        assert_eq!(&engine.fetch(&digest, true).unwrap().unwrap()[..], &data[..]);
    }
}

#[test]
fn test_known_digest_vector() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    assert_eq!(
        engine.store(b"abc").unwrap(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn test_store_is_idempotent() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    let first = engine.store(b"same bytes").unwrap();
    let before = engine.stats().unwrap();
    let second = engine.store(b"same bytes").unwrap();
    let after = engine.stats().unwrap();

    assert_eq!(first, second);
    assert_eq!(before.used_bytes, after.used_bytes);
    assert_eq!(before.records, after.records);
    assert_eq!(after.objects, 1);
}

#[test]
fn test_fetch_unknown_digest_is_absent() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    let unknown = Digest::of(b"never stored").to_hex();
    assert!(engine.fetch(&unknown, true).unwrap().is_none());
    assert!(engine.fetch(&unknown.to_uppercase(), true).unwrap().is_none());
}

#[test]
fn test_fetch_accepts_uppercase_hex() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    let digest = engine.store(b"case").unwrap();
    assert_eq!(
        &engine.fetch(&digest.to_uppercase(), true).unwrap().unwrap()[..],
        b"case"
    );
}

// ============================================================================
// Associations
// ============================================================================

#[test]
fn test_associate_then_get() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    assert!(engine.associate(b"colour", b"blue").unwrap());
    assert_eq!(&engine.get("colour", true).unwrap().unwrap()[..], b"blue");
    assert!(engine.get("color", true).unwrap().is_none());

    assert!(engine.associate(b"colour", b"green").unwrap());
    assert_eq!(&engine.get("colour", true).unwrap().unwrap()[..], b"green");
    assert_eq!(engine.stats().unwrap().associations, 1);
}

#[test]
fn test_get_with_uppercase_digest_fetches_content() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    let digest = engine.store(b"payload").unwrap();
    let upper = digest.to_uppercase();
    assert_eq!(&engine.get(upper.as_str(), true).unwrap().unwrap()[..], b"payload");
}

#[test]
fn test_binary_keys() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    let key = [0u8, 159, 146, 150, 255];
    assert!(engine.associate(&key, b"binary").unwrap());
    assert_eq!(&engine.get(&key[..], true).unwrap().unwrap()[..], b"binary");
}

#[test]
fn test_flat_view() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 8192)).unwrap();

    let flat = engine.flat();
    assert!(flat.set("title", "instadb"));
    assert_eq!(flat.get_string("title").as_deref(), Some("instadb"));
    assert_eq!(&engine.get("title", true).unwrap().unwrap()[..], b"instadb");
}

// ============================================================================
// Read-only overlays
// ============================================================================

#[test]
fn test_overlay_serves_misses() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("base.db");
    let main = dir.path().join("main.db");

    let digest = {
        let engine = Engine::open(Config::new(&base, 8192)).unwrap();
        engine.associate(b"origin", b"base").unwrap();
        let digest = engine.store(b"shared payload").unwrap();
        engine.close().unwrap();
        digest
    };

    let engine = Engine::open(Config::builder(&main, 8192).read_only(&base).build()).unwrap();
    assert_eq!(
        &engine.fetch(&digest, true).unwrap().unwrap()[..],
        b"shared payload"
    );
    assert_eq!(&engine.get("origin", true).unwrap().unwrap()[..], b"base");

    // Already reachable through the overlay, so nothing is written
    assert_eq!(engine.store(b"shared payload").unwrap(), digest);
    assert_eq!(engine.stats().unwrap().records, 0);

    // The primary shadows the overlay once it has its own value
    engine.associate(b"origin", b"main").unwrap();
    assert_eq!(&engine.get("origin", true).unwrap().unwrap()[..], b"main");
}

#[test]
fn test_empty_value_hides_overlay_key() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("base.db");
    let main = dir.path().join("main.db");

    {
        let engine = Engine::open(Config::new(&base, 8192)).unwrap();
        engine.associate(b"k", b"from base").unwrap();
    }

    let engine = Engine::open(Config::builder(&main, 8192).read_only(&base).build()).unwrap();
    assert!(engine.get("k", true).unwrap().is_some());
    engine.associate(b"k", b"").unwrap();
    assert!(engine.get("k", true).unwrap().is_none());
}

#[test]
fn test_overlay_is_not_modified() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("base.db");
    let main = dir.path().join("main.db");

    {
        let engine = Engine::open(Config::new(&base, 8192)).unwrap();
        engine.store(b"base object").unwrap();
    }
    let before = std::fs::read(&base).unwrap();

    {
        let engine =
            Engine::open(Config::builder(&main, 8192).read_only(&base).build()).unwrap();
        engine.store(b"new object").unwrap();
        engine.associate(b"key", b"value").unwrap();
    }

    assert_eq!(std::fs::read(&base).unwrap(), before);
}

#[test]
fn test_missing_overlay_fails_open() {
    let dir = tempdir().unwrap();
    let config = Config::builder(dir.path().join("main.db"), 8192)
        .read_only(dir.path().join("absent.db"))
        .build();

    assert!(matches!(Engine::open(config), Err(Error::Init(_))));
}

// ============================================================================
// Copies
// ============================================================================

#[test]
fn test_copies_mirror_primary() {
    let dir = tempdir().unwrap();
    let main = dir.path().join("main.db");
    let copy_a = dir.path().join("copy_a.db");
    let copy_b = dir.path().join("copy_b.db");

    let digest = {
        let config = Config::builder(&main, 8192)
            .copy(&copy_a)
            .copy(&copy_b)
            .sync_writes(true)
            .build();
        let engine = Engine::open(config).unwrap();
        let digest = engine.store(b"mirrored").unwrap();
        engine.associate(b"where", b"everywhere").unwrap();
        assert_eq!(engine.stats().unwrap().copies, 2);
        engine.close().unwrap();
        digest
    };

    let primary = std::fs::read(&main).unwrap();
    assert_eq!(std::fs::read(&copy_a).unwrap(), primary);
    assert_eq!(std::fs::read(&copy_b).unwrap(), primary);

    // A copy opened on its own serves the same data
    let engine = Engine::open(Config::new(&copy_b, 8192)).unwrap();
    assert_eq!(&engine.fetch(&digest, true).unwrap().unwrap()[..], b"mirrored");
    assert_eq!(&engine.get("where", true).unwrap().unwrap()[..], b"everywhere");
}

#[test]
fn test_former_standalone_store_serves_primary_data_as_copy() {
    let dir = tempdir().unwrap();
    let main = dir.path().join("main.db");
    let copy = dir.path().join("copy.db");

    // Used on its own first, leaving a sidecar index behind
    let own = {
        let engine = Engine::open(Config::new(&copy, 8192)).unwrap();
        let digest = engine.store(b"b").unwrap();
        engine.close().unwrap();
        digest
    };

    let mirrored = {
        let engine = Engine::open(Config::builder(&main, 8192).copy(&copy).build()).unwrap();
        let digest = engine.store(b"a").unwrap();
        engine.close().unwrap();
        digest
    };
    assert_eq!(std::fs::read(&copy).unwrap(), std::fs::read(&main).unwrap());

    let engine = Engine::open(Config::new(&copy, 8192)).unwrap();
    assert_eq!(&engine.fetch(&mirrored, true).unwrap().unwrap()[..], b"a");
    assert!(engine.fetch(&own, true).unwrap().is_none());
}

#[test]
fn test_copy_with_other_size_fails_open() {
    let dir = tempdir().unwrap();
    let copy = dir.path().join("copy.db");
    drop(Engine::open(Config::new(&copy, 4096)).unwrap());

    let config = Config::builder(dir.path().join("main.db"), 8192)
        .copy(&copy)
        .build();
    assert!(matches!(Engine::open(config), Err(Error::Init(_))));
}

// ============================================================================
// Capacity and eviction
// ============================================================================

#[test]
fn test_oversized_object_is_rejected() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 1024)).unwrap();

    let result = engine.store(&noise(2000));
    assert!(matches!(result, Err(Error::Capacity { .. })));

    // The store is still usable
    let digest = engine.store(b"small").unwrap();
    assert_eq!(&engine.fetch(&digest, true).unwrap().unwrap()[..], b"small");
    assert_eq!(engine.store(b"").unwrap(), "");
}

#[test]
fn test_eviction_keeps_usage_bounded() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 4096)).unwrap();

    let digests: Vec<String> = (0..200)
        .map(|i| engine.store(&noise(100 + i)).unwrap())
        .collect();

    let stats = engine.stats().unwrap();
    assert!(stats.used_bytes <= stats.capacity);
    assert!(stats.objects < digests.len());

    // The oldest are gone, the newest survive
    assert!(engine.fetch(&digests[0], true).unwrap().is_none());
    let last = digests.last().unwrap();
    assert_eq!(
        &engine.fetch(last, true).unwrap().unwrap()[..],
        &noise(299)[..]
    );
}

#[test]
fn test_evicted_object_can_be_stored_again() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("main.db"), 2048)).unwrap();

    let first = engine.store(&noise(500)).unwrap();
    for i in 0..20u8 {
        let mut filler = noise(400);
        filler[0] = i;
        engine.store(&filler).unwrap();
    }
    assert!(engine.fetch(&first, true).unwrap().is_none());

    assert_eq!(engine.store(&noise(500)).unwrap(), first);
    assert!(engine.fetch(&first, true).unwrap().is_some());
}

// ============================================================================
// Reopen
// ============================================================================

#[test]
fn test_reopen_is_transparent() {
    for persist_index in [true, false] {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.db");
        let config = Config::builder(&path, 16384)
            .persist_index(persist_index)
            .build();

        let digest = {
            let engine = Engine::open(config.clone()).unwrap();
            engine.associate(b"k", b"v1").unwrap();
            engine.associate(b"k", b"v2").unwrap();
            let digest = engine.store(b"persisted").unwrap();
            engine.close().unwrap();
            digest
        };

        let engine = Engine::open(config).unwrap();
        assert_eq!(&engine.fetch(&digest, true).unwrap().unwrap()[..], b"persisted");
        assert_eq!(&engine.get("k", true).unwrap().unwrap()[..], b"v2");
        let stats = engine.stats().unwrap();
        assert_eq!(stats.objects, 1);
        assert_eq!(stats.associations, 1);
    }
}

#[test]
fn test_reopen_with_other_size_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.db");
    drop(Engine::open(Config::new(&path, 8192)).unwrap());

    assert!(matches!(
        Engine::open(Config::new(&path, 16384)),
        Err(Error::Init(_))
    ));
}

#[test]
fn test_second_handle_sees_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.db");

    let writer = Engine::open(Config::new(&path, 16384)).unwrap();
    let reader = Engine::open(Config::new(&path, 16384)).unwrap();

    let digest = writer.store(b"from the writer").unwrap();
    writer.associate(b"note", b"hi").unwrap();

    assert_eq!(
        &reader.fetch(&digest, true).unwrap().unwrap()[..],
        b"from the writer"
    );
    assert_eq!(&reader.get("note", true).unwrap().unwrap()[..], b"hi");
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_stores_and_associations() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(Config::new(dir.path().join("main.db"), 1 << 20)).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut stored = Vec::new();
                for i in 0..50 {
                    let data = format!("thread {} item {}", t, i);
                    let digest = engine.store(data.as_bytes()).unwrap();
                    engine
                        .associate(format!("t{}-{}", t, i).as_bytes(), data.as_bytes())
                        .unwrap();
                    stored.push((digest, data));
                }
                stored
            })
        })
        .collect();

    let stored: Vec<(String, String)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(stored.len(), 400);
    for (digest, data) in &stored {
        assert_eq!(&engine.fetch(digest, true).unwrap().unwrap()[..], data.as_bytes());
    }
    for t in 0..8 {
        for i in 0..50 {
            let expected = format!("thread {} item {}", t, i);
            let key = format!("t{}-{}", t, i);
            assert_eq!(
                &engine.get(key.as_str(), true).unwrap().unwrap()[..],
                expected.as_bytes()
            );
        }
    }

    let stats = engine.stats().unwrap();
    assert_eq!(stats.objects, 400);
    assert_eq!(stats.associations, 400);
}
