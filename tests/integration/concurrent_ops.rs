//! Concurrent mutation tests
//!
//! Several threads share one table, each with its own registered context.
//! These tests check that:
//! - Inserting the same key from many threads has exactly one winner
//! - Locked read-modify-write through a cursor never loses an update
//! - Readers always find keys that were present before they started
//! - Layer creation and collection race safely with inserts below them

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use triekv::{Finish, KeyCodec, ScanCallbacks, Table, TableOptions, ValueHandle};

const THREADS: usize = 8;

fn be(key: u64) -> Vec<u8> {
    let mut out = Vec::new();
    u64::encode_key(&key, &mut out);
    out
}

#[test]
fn same_key_inserted_once() {
    const SHARED: u64 = 2_000;
    let table = Arc::new(Table::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let wins = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let wins = Arc::clone(&wins);
            thread::spawn(move || {
                let me = table.register(t);
                barrier.wait();
                for key in 0..SHARED {
                    if table.insert(&me, &be(key), ValueHandle(t + 1)) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(wins.load(Ordering::Relaxed), SHARED as usize);
    let me = table.main_context();
    for key in 0..SHARED {
        let value = table.get(&me, &be(key)).expect("key inserted by some thread");
        assert!((1..=THREADS).contains(&value.get()));
    }
}

#[test]
fn disjoint_inserts_all_land() {
    const PER_THREAD: u64 = 5_000;
    let table = Arc::new(Table::with_options(TableOptions::benchmark()).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let me = table.register(t);
                let mut rng = ChaCha8Rng::seed_from_u64(t as u64);
                let mut keys: Vec<u64> = (0..PER_THREAD).map(|i| i * THREADS as u64 + t as u64).collect();
                // interleave the key ranges of different threads
                for i in (1..keys.len()).rev() {
                    keys.swap(i, rng.gen_range(0..=i));
                }
                barrier.wait();
                for key in keys {
                    assert!(table.insert(&me, &be(key), ValueHandle(key as usize)));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let me = table.main_context();
    let total = PER_THREAD * THREADS as u64;
    let mut next = 0u64;
    let mut visitor = ScanCallbacks::entries(|key: &[u8], value: ValueHandle| {
        assert_eq!(u64::decode_key(key), Some(next));
        assert_eq!(value.get(), next as usize);
        next += 1;
        true
    });
    let delivered = table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut visitor, None);
    assert_eq!(delivered as u64, total);
    assert!(table.stats_snapshot().leaf_splits > 0);
}

#[test]
fn cursor_increments_are_not_lost() {
    const ROUNDS: usize = 2_000;
    let table = Arc::new(Table::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let me = table.register(t);
                barrier.wait();
                for _ in 0..ROUNDS {
                    let mut cursor = table.cursor(&me, b"shared/counter");
                    if cursor.find_insert() {
                        let seen = cursor.value().map_or(0, ValueHandle::get);
                        cursor.set_value(ValueHandle(seen + 1));
                        cursor.finish(Finish::Release);
                    } else {
                        cursor.set_value(ValueHandle(1));
                        cursor.finish(Finish::CommitInsert);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let me = table.main_context();
    assert_eq!(table.get(&me, b"shared/counter"), Some(ValueHandle(THREADS * ROUNDS)));
}

#[test]
fn readers_see_preloaded_keys_during_splits() {
    const PRELOADED: u64 = 2_000;
    const WRITERS: usize = 4;
    const READERS: usize = 4;
    let table = Arc::new(Table::new());
    {
        let me = table.main_context();
        for key in 0..PRELOADED {
            assert!(table.insert(&me, &be(key * 2), ValueHandle(1)));
        }
    }
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(WRITERS + READERS));

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let me = table.register(w);
                barrier.wait();
                // odd keys land between preloaded ones and force splits
                for key in (0..PRELOADED).filter(|k| k % WRITERS as u64 == w as u64) {
                    assert!(table.insert(&me, &be(key * 2 + 1), ValueHandle(2)));
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|r| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let me = table.register(WRITERS + r);
                let mut rng = ChaCha8Rng::seed_from_u64(r as u64 + 100);
                barrier.wait();
                let mut passes = 0;
                while !done.load(Ordering::Acquire) || passes < 3 {
                    for _ in 0..500 {
                        let key = rng.gen_range(0..PRELOADED) * 2;
                        assert_eq!(table.get(&me, &be(key)), Some(ValueHandle(1)), "key {key}");
                    }
                    let mut seen = BTreeSet::new();
                    let mut last: Option<Vec<u8>> = None;
                    let mut visitor = ScanCallbacks::entries(|key: &[u8], _| {
                        if let Some(prev) = &last {
                            assert!(prev.as_slice() < key, "scan went backwards");
                        }
                        last = Some(key.to_vec());
                        if let Some(k) = u64::decode_key(key) {
                            seen.insert(k);
                        }
                        true
                    });
                    table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut visitor, None);
                    assert!((0..PRELOADED).all(|k| seen.contains(&(k * 2))));
                    passes += 1;
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().expect("writer panicked");
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader panicked");
    }
}

#[test]
fn layer_churn_under_contention() {
    const ROUNDS: usize = 300;
    let table = Arc::new(Table::with_options(TableOptions::compact()).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let me = table.register(t);
                let mut rng = ChaCha8Rng::seed_from_u64(t as u64 * 31);
                barrier.wait();
                for round in 0..ROUNDS {
                    // every thread shares the two 8-byte prefixes
                    let group = rng.gen_range(0..2u8);
                    let key = format!("prefix-{group}/{t:02}/{round:05}/tail-of-key").into_bytes();
                    assert!(table.insert(&me, &key, ValueHandle(round + 1)));
                    assert_eq!(table.get(&me, &key), Some(ValueHandle(round + 1)));
                    assert!(table.remove(&me, &key));
                    assert_eq!(table.get(&me, &key), None);
                }
                table.quiesce(&me);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let me = table.main_context();
    let mut visitor = ScanCallbacks::entries(|_: &[u8], _| true);
    assert_eq!(table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut visitor, None), 0);
    let stats = table.stats_snapshot();
    assert!(stats.layers_created > 0);
    assert!(stats.layers_collected > 0);
    assert!(stats.layers_collected <= stats.layers_created);
}
