//! Layer collection and node reclamation tests
//!
//! Removing the last key under a shared prefix unlinks the layer that held
//! it. Unlinked nodes are only recycled once no pinned thread can reach
//! them, including nodes whose retiring thread has since exited.

#![allow(missing_docs)]

use std::ops::Bound;
use std::sync::{Arc, Barrier, Once};
use std::thread;

use tracing_subscriber::EnvFilter;
use triekv::{ScanCallbacks, Table, TableOptions, ThreadRegistry, ValueHandle};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("triekv=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn long_key(prefix: usize, suffix: &str) -> Vec<u8> {
    format!("{prefix:08}{suffix}").into_bytes()
}

#[test]
fn churn_reuses_reclaimed_layers() {
    init_tracing();
    const PREFIXES: usize = 50;
    let table = Table::with_options(TableOptions::default().reclaim_batch(1_000)).unwrap();
    let me = table.register(0);
    let mut steady = None;

    for round in 0..10 {
        for p in 0..PREFIXES {
            assert!(table.insert(&me, &long_key(p, "/value"), ValueHandle(round + 1)));
        }
        for p in 0..PREFIXES {
            assert!(table.remove(&me, &long_key(p, "/value")));
        }
        assert_eq!(table.quiesce(&me), PREFIXES);
        let (allocated, free) = table.arena_usage();
        assert_eq!(free, PREFIXES);
        match steady {
            None => steady = Some(allocated),
            Some(first) => assert_eq!(allocated, first, "round {round} grew the arena"),
        }
    }

    let stats = table.stats_snapshot();
    assert_eq!(stats.layers_created, 10 * PREFIXES as u64);
    assert_eq!(stats.layers_collected, 10 * PREFIXES as u64);
    assert_eq!(stats.nodes_reclaimed, 10 * PREFIXES as u64);
    table.emit_stats();
}

#[test]
fn pinned_reader_delays_reclamation() {
    init_tracing();
    let table = Table::with_options(TableOptions::default().reclaim_batch(1_000)).unwrap();
    let me = table.register(0);
    assert!(table.insert(&me, &long_key(1, "/a"), ValueHandle(1)));
    assert!(table.insert(&me, &long_key(2, "/b"), ValueHandle(2)));

    // the visitor removes the other key's layer while the scan is pinned
    let mut reclaimed_inside = usize::MAX;
    let mut visitor = ScanCallbacks::entries(|key: &[u8], _| {
        if key == long_key(1, "/a").as_slice() {
            assert!(table.remove(&me, &long_key(2, "/b")));
            reclaimed_inside = table.quiesce(&me);
        }
        true
    });
    let delivered = table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut visitor, None);
    assert_eq!(delivered, 1);
    assert_eq!(reclaimed_inside, 0);
    assert_eq!(table.quiesce(&me), 1);
    assert_eq!(table.stats_snapshot().nodes_reclaimed, 1);
}

#[test]
fn exited_threads_leave_reclamation_to_survivors() {
    const WORKERS: usize = 4;
    const KEYS: usize = 20;
    let table = Arc::new(Table::with_options(TableOptions::default().reclaim_batch(1_000)).unwrap());
    let barrier = Arc::new(Barrier::new(WORKERS));

    let workers: Vec<_> = (0..WORKERS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let me = table.register(t);
                barrier.wait();
                for k in 0..KEYS {
                    let key = long_key(t * KEYS + k, "/payload");
                    assert!(table.insert(&me, &key, ValueHandle(k)));
                    assert!(table.remove(&me, &key));
                }
                assert_eq!(me.context().pending(), KEYS);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let registry = table.registry();
    assert_eq!(registry.orphaned(), WORKERS * KEYS);
    let me = table.main_context();
    assert_eq!(table.quiesce(&me), WORKERS * KEYS);
    assert_eq!(registry.orphaned(), 0);
    assert_eq!(table.arena_usage().1, WORKERS * KEYS);
}

#[test]
fn tables_can_share_a_registry() {
    let registry = Arc::new(ThreadRegistry::with_reclaim_batch(2).unwrap());
    let first = Table::with_registry(Arc::clone(&registry), TableOptions::default()).unwrap();
    let second = Table::with_registry(Arc::clone(&registry), TableOptions::default()).unwrap();
    let me = registry.register(0);
    assert_eq!(registry.len(), 1);

    for table in [&first, &second] {
        assert!(table.insert(&me, &long_key(7, "/shared"), ValueHandle(7)));
    }
    assert!(first.remove(&me, &long_key(7, "/shared")));
    assert!(second.remove(&me, &long_key(7, "/shared")));
    // the batch filled while the remover was still pinned
    assert_eq!(me.context().pending(), 2);
    assert_eq!(first.quiesce(&me), 2);
    assert_eq!(me.context().pending(), 0);
    assert_eq!(first.stats_snapshot().nodes_reclaimed, 1);
    assert_eq!(second.stats_snapshot().nodes_reclaimed, 1);
}
