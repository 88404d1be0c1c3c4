//! Stress tests for concurrent map operations.
//!
//! These aim at the races the design has to win:
//! - insert uniqueness (one winner per key),
//! - erase uniqueness (one winner per removal),
//! - no lost updates across concurrent inserts,
//! - snapshot inclusion of keys that stay put,
//! - survival of a mixed insert/remove workload with reclamation churn.
//!
//! Run with the alternative allocator the benchmarks use:
//! ```bash
//! cargo test --test stress_tests --features mimalloc --release
//! ```

#![expect(clippy::unwrap_used)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use skipmap::SkipListMap;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Small deterministic PRNG so failures reproduce.
fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

#[test]
fn concurrent_inserts_of_distinct_keys() {
    common::init_tracing();

    const NUM_THREADS: u64 = 8;
    const KEYS_PER_THREAD: u64 = 125;
    const TOTAL: u64 = NUM_THREADS * KEYS_PER_THREAD;

    let map = Arc::new(SkipListMap::new());

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..KEYS_PER_THREAD {
                    let key = t * KEYS_PER_THREAD + i;
                    assert!(map.insert(key, key * 3), "key {key} inserted twice");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let values = map.values();
    assert_eq!(values.len(), usize::try_from(TOTAL).unwrap());

    let keys: HashSet<u64> = map.entries().iter().map(|(key, _)| *key).collect();
    assert_eq!(keys, (0..TOTAL).collect::<HashSet<u64>>());

    for key in 0..TOTAL {
        assert_eq!(map.get(&key), Some(key * 3));
    }
}

#[test]
fn concurrent_inserts_of_one_key_have_a_single_winner() {
    common::init_tracing();

    const NUM_THREADS: usize = 16;
    const ABSENT_KEY: u64 = 42;

    for _ in 0..50 {
        let map = Arc::new(SkipListMap::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let winning_value = Arc::new(AtomicUsize::new(usize::MAX));

        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|t| {
                let map = Arc::clone(&map);
                let winners = Arc::clone(&winners);
                let winning_value = Arc::clone(&winning_value);
                thread::spawn(move || {
                    if map.insert(ABSENT_KEY, t) {
                        winners.fetch_add(1, Ordering::SeqCst);
                        winning_value.store(t, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(map.get(&ABSENT_KEY), Some(winning_value.load(Ordering::SeqCst)));
    }
}

#[test]
fn concurrent_erases_of_one_key_have_a_single_winner() {
    common::init_tracing();

    const NUM_THREADS: usize = 16;
    const KEY: u64 = 42;

    for _ in 0..50 {
        let map = Arc::new(SkipListMap::new());
        assert!(map.insert(KEY, "present"));

        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let map = Arc::clone(&map);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if map.remove(&KEY) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1, "exactly one eraser may win");
        assert_eq!(map.get(&KEY), None);
        assert!(!map.contains_key(&KEY));
    }
}

#[test]
fn mixed_workload_survives_and_stays_consistent() {
    common::init_tracing();

    const NUM_THREADS: u64 = 4;
    const OPS_PER_THREAD: u64 = 50_000;
    const KEY_SPACE: u64 = 256;

    let map = Arc::new(SkipListMap::new());

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut state = 0x9e37_79b9_7f4a_7c15_u64.wrapping_mul(t + 1);
                for _ in 0..OPS_PER_THREAD {
                    let key = xorshift(&mut state) % KEY_SPACE;
                    match xorshift(&mut state) % 4 {
                        0 => {
                            let _ = map.remove(&key);
                        }
                        1 | 2 => {
                            let _ = map.insert(key, key.wrapping_mul(7));
                        }
                        _ => {
                            // A hit must carry the one value keys ever get.
                            if let Some(value) = map.get(&key) {
                                assert_eq!(value, key.wrapping_mul(7));
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Quiescent verification pass: strictly sorted, point reads agree with
    // the snapshot, and the map still accepts writes.
    let entries = map.entries();
    assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
    for (key, value) in &entries {
        assert_eq!(map.get(key), Some(*value));
        assert_eq!(*value, key.wrapping_mul(7));
    }

    for key in 0..KEY_SPACE {
        let _ = map.remove(&key);
    }
    assert!(map.entries().is_empty());
    assert_eq!(map.first_key(), None);
}

/// Keys that are present before a snapshot starts and never removed must
/// appear in it, no matter how much the rest of the map churns.
#[test]
fn snapshots_include_keys_that_stay_put() {
    common::init_tracing();

    const STABLE_KEYS: u64 = 64;
    const CHURN_THREADS: u64 = 3;
    const SNAPSHOTS: usize = 200;

    let map = Arc::new(SkipListMap::new());
    for key in 0..STABLE_KEYS {
        assert!(map.insert(key, key + 1_000_000));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let churners: Vec<_> = (0..CHURN_THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut state = 0xbf58_476d_1ce4_e5b9_u64.wrapping_mul(t + 1);
                while !stop.load(Ordering::Relaxed) {
                    // Churn keys strictly above the stable range.
                    let key = STABLE_KEYS + xorshift(&mut state) % 512;
                    if xorshift(&mut state) % 2 == 0 {
                        let _ = map.insert(key, key);
                    } else {
                        let _ = map.remove(&key);
                    }
                }
            })
        })
        .collect();

    for _ in 0..SNAPSHOTS {
        let values: HashSet<u64> = map.values().into_iter().collect();
        for key in 0..STABLE_KEYS {
            assert!(
                values.contains(&(key + 1_000_000)),
                "snapshot lost stable key {key}"
            );
        }
    }

    stop.store(true, Ordering::Relaxed);
    for churner in churners {
        churner.join().unwrap();
    }
}

/// Interleaved insert and remove of the same keys from many threads: each
/// key ends up either absent or holding a value some thread wrote for it.
#[test]
fn contended_insert_remove_cycles() {
    common::init_tracing();

    const NUM_THREADS: u64 = 8;
    const ROUNDS: u64 = 2_000;
    const KEY_SPACE: u64 = 16;

    let map = Arc::new(SkipListMap::new());

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let key = (t + round) % KEY_SPACE;
                    if map.insert(key, t) {
                        // We own this incarnation; a racing remover may or
                        // may not take it out before we do.
                        let _ = map.remove(&key);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let entries = map.entries();
    assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
    for (key, value) in entries {
        assert!(key < KEY_SPACE);
        assert!(value < NUM_THREADS);
    }
}
