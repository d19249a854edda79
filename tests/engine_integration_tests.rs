//! Integration Tests for the Cache Engine
//!
//! Exercises the public engine API end to end against a real store in a
//! temporary directory.

use std::sync::Arc;
use std::thread;

use sqcache::{CacheConfig, CacheEngine, CacheError};
use tempfile::TempDir;

// == Helper Functions ==

const ENTRY_SIZE: usize = 100 * 1024;

fn open_engine(dir: &TempDir, max_mb: i64, cap: f64) -> CacheEngine {
    let config =
        CacheConfig::from_megabytes(dir.path().join("cache"), max_mb, cap).with_sync_writes(false);
    CacheEngine::open(config).expect("engine should open")
}

fn payload(i: usize) -> Vec<u8> {
    let mut data = vec![(i % 251) as u8; ENTRY_SIZE];
    data[..8].copy_from_slice(&(i as u64).to_le_bytes());
    data
}

fn is_hit(engine: &CacheEngine, freshness: &str, i: usize) -> bool {
    match engine.get("items", "tenant", freshness, &i.to_string()) {
        Ok(data) => {
            assert_eq!(data, payload(i), "entry {} returned wrong content", i);
            true
        }
        Err(err) => {
            assert!(err.is_not_found(), "unexpected error for {}: {}", i, err);
            false
        }
    }
}

// == Scenario Tests ==

#[test]
fn test_lru_and_generation_scenario() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, 10, 0.5);

    for i in 1..=90 {
        engine.set("items", "tenant", "fresh1", &i.to_string(), &payload(i)).unwrap();
    }
    for i in 1..=90 {
        assert!(is_hit(&engine, "fresh1", i), "entry {} should hit", i);
    }

    for i in 91..=200 {
        engine.set("items", "tenant", "fresh1", &i.to_string(), &payload(i)).unwrap();
    }

    for i in 1..=99 {
        assert!(!is_hit(&engine, "fresh1", i), "entry {} should have been evicted", i);
    }
    for i in 131..=200 {
        assert!(is_hit(&engine, "fresh1", i), "entry {} should hit", i);
    }

    let stats = engine.stats().unwrap();
    assert!(stats.current_size_bytes <= stats.max_size_bytes);
    assert!(stats.evictions >= 99);

    // the next generation is invisible until written
    assert!(!is_hit(&engine, "fresh2", 1));

    for i in 1..=10 {
        engine.set("items", "tenant", "fresh2", &i.to_string(), &payload(i)).unwrap();
    }
    for i in 1..=10 {
        assert!(is_hit(&engine, "fresh2", i), "entry {} should hit under fresh2", i);
    }
    for i in (1..=10).chain(131..=200) {
        assert!(!is_hit(&engine, "fresh1", i), "fresh1 entry {} should be unreachable", i);
    }

    // only the ten fresh2 entries are still resident
    let stats = engine.stats().unwrap();
    assert_eq!(stats.current_size_bytes, 10 * ENTRY_SIZE as u64);
}

#[test]
fn test_exact_eviction_boundary() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, 10, 0.5);

    for i in 1..=200 {
        engine.set("items", "tenant", "fresh1", &i.to_string(), &payload(i)).unwrap();
    }

    // 102 entries fit under 10 MiB; each pass keeps the newest 51
    for i in 1..=104 {
        assert!(!is_hit(&engine, "fresh1", i));
    }
    for i in 105..=200 {
        assert!(is_hit(&engine, "fresh1", i));
    }
}

#[test]
fn test_delete_table_across_tenants_and_generations() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, 10, 0.8);

    engine.set("users", "a", "1", "x", b"ua").unwrap();
    engine.set("users", "b", "2", "x", b"ub").unwrap();
    engine.set("orders", "a", "1", "x", b"oa").unwrap();

    engine.delete("users").unwrap();

    assert!(engine.get("users", "a", "1", "x").unwrap_err().is_not_found());
    assert!(engine.get("users", "b", "2", "x").unwrap_err().is_not_found());
    assert_eq!(engine.get("orders", "a", "1", "x").unwrap(), b"oa");
}

#[test]
fn test_lifecycle_gating() {
    let dir = TempDir::new().unwrap();
    let engine = CacheEngine::new();

    assert!(matches!(
        engine.set("t", "x", "g", "b", b"v"),
        Err(CacheError::NotInitialized(_))
    ));

    engine
        .init(CacheConfig::from_megabytes(dir.path().join("cache"), 1, 0.5).with_sync_writes(false))
        .unwrap();
    engine.set("t", "x", "g", "b", b"v").unwrap();
    engine.close().unwrap();

    assert!(matches!(
        engine.get("t", "x", "g", "b"),
        Err(CacheError::NotInitialized(_))
    ));
    assert!(matches!(engine.delete("t"), Err(CacheError::NotInitialized(_))));
}

#[test]
fn test_reopen_resumes_contents_and_order() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(&dir, 1, 0.5);
        for i in 0..8 {
            engine.set("t", "x", "g", &format!("k{}", i), &vec![1u8; 100 * 1024]).unwrap();
        }
        // k0 is now the most recently used entry
        engine.get("t", "x", "g", "k0").unwrap();
        engine.close().unwrap();
    }

    let engine = open_engine(&dir, 1, 0.5);
    assert_eq!(engine.stats().unwrap().current_size_bytes, 8 * 100 * 1024);

    // 11 entries exceed 1 MiB; eviction removes the oldest, which k0 is not
    for i in 8..11 {
        engine.set("t", "x", "g", &format!("k{}", i), &vec![1u8; 100 * 1024]).unwrap();
    }
    assert!(engine.get("t", "x", "g", "k0").is_ok());
    assert!(engine.get("t", "x", "g", "k1").is_err());
    assert!(engine.stats().unwrap().current_size_bytes <= 512 * 1024);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(open_engine(&dir, 1, 0.5));

    let handles: Vec<_> = (0..6)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..40 {
                    let bind = format!("{}-{}", worker, i);
                    engine.set("t", "shared", "g", &bind, &vec![worker as u8; 4096]).unwrap();
                    if let Ok(data) = engine.get("t", "shared", "g", &bind) {
                        assert!(data.iter().all(|b| *b == worker as u8));
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = engine.stats().unwrap();
    assert!(stats.current_size_bytes <= stats.max_size_bytes);
}
