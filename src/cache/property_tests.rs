//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the engine's size, visibility and eviction
//! guarantees against random operation sequences. Each case opens a fresh
//! store in a temporary directory, so case counts are kept small.

use proptest::prelude::*;
use std::collections::HashMap;
use tempfile::TempDir;

use crate::cache::CacheEngine;
use crate::config::CacheConfig;

// == Test Configuration ==
const TEST_MAX_SIZE: u64 = 4096;
const TEST_CAP: f64 = 0.5;

fn create_engine(max: u64, cap: f64) -> (CacheEngine, TempDir) {
    let dir = TempDir::new().expect("TempDir creation should succeed");
    let config = CacheConfig::new(dir.path().join("cache"), max, cap).with_sync_writes(false);
    let engine = CacheEngine::open(config).expect("engine should open");
    (engine, dir)
}

// == Strategies ==
/// Generates valid key components (non-empty, short)
fn component_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,12}"
}

/// Generates payloads, including empty ones
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..600)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set {
        tenant: u8,
        freshness: u8,
        bind: u8,
        payload: Vec<u8>,
    },
    Get {
        tenant: u8,
        freshness: u8,
        bind: u8,
    },
    Delete,
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        6 => (0u8..3, 0u8..3, 0u8..8, payload_strategy()).prop_map(
            |(tenant, freshness, bind, payload)| CacheOp::Set {
                tenant,
                freshness,
                bind,
                payload
            }
        ),
        3 => (0u8..3, 0u8..3, 0u8..8)
            .prop_map(|(tenant, freshness, bind)| CacheOp::Get { tenant, freshness, bind }),
        1 => Just(CacheOp::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // Property 1: Round-trip
    // Content stored under a key is returned byte for byte, empty content included.
    #[test]
    fn prop_roundtrip_storage(
        table in component_strategy(),
        tenant in component_strategy(),
        freshness in component_strategy(),
        bind in component_strategy(),
        payload in payload_strategy()
    ) {
        let (engine, _dir) = create_engine(TEST_MAX_SIZE, TEST_CAP);
        engine.set(&table, &tenant, &freshness, &bind, &payload).unwrap();
        let retrieved = engine.get(&table, &tenant, &freshness, &bind).unwrap();
        prop_assert_eq!(retrieved, payload, "Round-trip value mismatch");
    }

    // Property 2: Size bound and generation isolation
    // After every Set the resident size is within the maximum, and a hit is
    // only ever served for the most recently written generation of a pair,
    // with the content last written under that key.
    #[test]
    fn prop_size_bound_and_isolation(ops in prop::collection::vec(cache_op_strategy(), 1..60)) {
        let (engine, _dir) = create_engine(TEST_MAX_SIZE, TEST_CAP);
        let mut active: HashMap<u8, u8> = HashMap::new();
        let mut written: HashMap<(u8, u8, u8), Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                CacheOp::Set { tenant, freshness, bind, payload } => {
                    engine
                        .set("t", &tenant.to_string(), &freshness.to_string(), &bind.to_string(), &payload)
                        .unwrap();
                    if active.insert(tenant, freshness) != Some(freshness) {
                        written.retain(|(t, _, _), _| *t != tenant);
                    }
                    written.insert((tenant, freshness, bind), payload);

                    let stats = engine.stats().unwrap();
                    prop_assert!(
                        stats.current_size_bytes <= stats.max_size_bytes,
                        "Cache size {} exceeds max {}",
                        stats.current_size_bytes,
                        stats.max_size_bytes
                    );
                }
                CacheOp::Get { tenant, freshness, bind } => {
                    let result = engine.get("t", &tenant.to_string(), &freshness.to_string(), &bind.to_string());
                    match result {
                        Ok(content) => {
                            prop_assert_eq!(active.get(&tenant), Some(&freshness), "Hit on a stale generation");
                            prop_assert_eq!(Some(&content), written.get(&(tenant, freshness, bind)));
                        }
                        Err(err) => prop_assert!(err.is_not_found()),
                    }
                }
                CacheOp::Delete => {
                    engine.delete("t").unwrap();
                    active.clear();
                    written.clear();
                    prop_assert_eq!(engine.stats().unwrap().current_size_bytes, 0);
                }
            }
        }
    }

    // Property 3: Eviction target
    // Whenever a Set pushes the cache above its maximum, the pass that follows
    // leaves it at or below max * cap.
    #[test]
    fn prop_eviction_reaches_target(
        sizes in prop::collection::vec(1usize..800, 1..40),
        cap in 0.1f64..1.0
    ) {
        let (engine, _dir) = create_engine(TEST_MAX_SIZE, cap);
        let target = ((TEST_MAX_SIZE as f64) * cap).floor() as u64;
        let mut resident = 0u64;

        for (i, size) in sizes.into_iter().enumerate() {
            engine.set("t", "x", "g", &format!("k{}", i), &vec![0u8; size]).unwrap();
            resident += size as u64;
            let current = engine.stats().unwrap().current_size_bytes;

            if resident > TEST_MAX_SIZE {
                prop_assert!(current <= target, "size {} above target {}", current, target);
                resident = current;
            } else {
                prop_assert_eq!(current, resident);
            }
        }
    }
}
