//! Range scan ordering tests
//!
//! Forward and reverse scans are compared with a `BTreeMap` holding the
//! same keys, across key lengths that exercise several layers, and while
//! writers split leaves underneath the scan.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use triekv::{key_bound, KeyCodec, NodeRef, ScanVisitor, Table, ThreadHandle, ValueHandle};

#[derive(Default)]
struct Collect {
    leaves: Vec<NodeRef>,
    entries: Vec<(Vec<u8>, usize)>,
}

impl ScanVisitor for Collect {
    fn visit_node(&mut self, node: NodeRef, _version: u64) {
        self.leaves.push(node);
    }

    fn visit_entry(&mut self, key: &[u8], value: ValueHandle) -> bool {
        self.entries.push((key.to_vec(), value.get()));
        true
    }
}

fn owned(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(key) => Bound::Included(key.to_vec()),
        Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
    }
}

fn range<'a>(
    reference: &'a BTreeMap<Vec<u8>, usize>,
    lower: Bound<&[u8]>,
    upper: Bound<&[u8]>,
) -> impl DoubleEndedIterator<Item = (Vec<u8>, usize)> + 'a {
    let (lower, upper) = (owned(lower), owned(upper));
    reference
        .iter()
        .filter(move |(k, _)| {
            let above = match &lower {
                Bound::Unbounded => true,
                Bound::Included(b) => *k >= b,
                Bound::Excluded(b) => *k > b,
            };
            let below = match &upper {
                Bound::Unbounded => true,
                Bound::Included(b) => *k <= b,
                Bound::Excluded(b) => *k < b,
            };
            above && below
        })
        .map(|(k, v)| (k.clone(), *v))
}

fn random_key(rng: &mut ChaCha8Rng) -> Vec<u8> {
    // a narrow alphabet makes long shared prefixes common
    let len = match rng.gen_range(0..4) {
        0 => rng.gen_range(0..8),
        1 => 8,
        2 => rng.gen_range(9..17),
        _ => rng.gen_range(17..40),
    };
    (0..len).map(|_| b"\0abz"[rng.gen_range(0..4)]).collect()
}

fn populate(table: &Table, me: &ThreadHandle, seed: u64, count: usize) -> BTreeMap<Vec<u8>, usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut reference = BTreeMap::new();
    for i in 0..count {
        let key = random_key(&mut rng);
        let inserted = table.insert(me, &key, ValueHandle(i));
        assert_eq!(inserted, !reference.contains_key(&key));
        reference.entry(key).or_insert(i);
    }
    reference
}

#[test]
fn full_scans_match_reference_in_both_directions() {
    let table = Table::new();
    let me = table.register(0);
    let reference = populate(&table, &me, 1, 6_000);

    let mut forward = Collect::default();
    let delivered = table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut forward, None);
    assert_eq!(delivered, reference.len());
    assert!(forward.entries.iter().cloned().eq(range(&reference, Bound::Unbounded, Bound::Unbounded)));

    let mut backward = Collect::default();
    table.rscan(&me, Bound::Unbounded, Bound::Unbounded, &mut backward, None);
    assert!(backward
        .entries
        .iter()
        .cloned()
        .eq(range(&reference, Bound::Unbounded, Bound::Unbounded).rev()));
    assert!(!forward.leaves.is_empty());
}

#[test]
fn bounded_scans_match_reference() {
    let table = Table::new();
    let me = table.register(0);
    let reference = populate(&table, &me, 2, 3_000);
    let mut rng = ChaCha8Rng::seed_from_u64(3);

    for _ in 0..300 {
        let a = random_key(&mut rng);
        let b = random_key(&mut rng);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let lower = key_bound(rng.gen_bool(0.9).then_some(&lo[..]), rng.gen_bool(0.5));
        let upper = key_bound(rng.gen_bool(0.9).then_some(&hi[..]), rng.gen_bool(0.5));
        let limit = rng.gen_bool(0.3).then(|| rng.gen_range(1..20));
        let take = limit.unwrap_or(usize::MAX);

        let mut forward = Collect::default();
        table.scan(&me, lower, upper, &mut forward, limit);
        let expected: Vec<_> = range(&reference, lower, upper).take(take).collect();
        assert_eq!(forward.entries, expected, "scan {lower:?}..{upper:?}");

        let mut backward = Collect::default();
        table.rscan(&me, lower, upper, &mut backward, limit);
        let expected: Vec<_> = range(&reference, lower, upper).rev().take(take).collect();
        assert_eq!(backward.entries, expected, "rscan {lower:?}..{upper:?}");
    }
}

#[test]
fn every_leaf_is_announced_once_per_arrival() {
    let table = Table::new();
    let me = table.register(0);
    for key in 0..1_000u64 {
        let mut encoded = Vec::new();
        u64::encode_key(&key, &mut encoded);
        assert!(table.insert(&me, &encoded, ValueHandle(key as usize)));
    }
    let mut forward = Collect::default();
    table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut forward, None);
    let mut backward = Collect::default();
    table.rscan(&me, Bound::Unbounded, Bound::Unbounded, &mut backward, None);

    let mut unique = forward.leaves.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), forward.leaves.len());
    backward.leaves.reverse();
    assert_eq!(forward.leaves, backward.leaves);
}

#[test]
fn scans_stay_ordered_while_leaves_split() {
    const KEYS: u64 = 20_000;
    let table = Arc::new(Table::new());
    let barrier = Arc::new(Barrier::new(3));
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let table = Arc::clone(&table);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let me = table.register(0);
            let mut rng = ChaCha8Rng::seed_from_u64(9);
            barrier.wait();
            for _ in 0..KEYS {
                let mut key = Vec::new();
                u64::encode_key(&rng.gen(), &mut key);
                table.insert(&me, &key, ValueHandle(1));
            }
            done.store(true, Ordering::Release);
        })
    };

    let scanners: Vec<_> = [true, false]
        .into_iter()
        .enumerate()
        .map(|(i, forward)| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let me = table.register(i + 1);
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    let mut seen = Collect::default();
                    if forward {
                        table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut seen, None);
                    } else {
                        table.rscan(&me, Bound::Unbounded, Bound::Unbounded, &mut seen, None);
                    }
                    for pair in seen.entries.windows(2) {
                        if forward {
                            assert!(pair[0].0 < pair[1].0, "forward scan out of order");
                        } else {
                            assert!(pair[0].0 > pair[1].0, "reverse scan out of order");
                        }
                    }
                }
            })
        })
        .collect();

    writer.join().expect("writer panicked");
    for scanner in scanners {
        scanner.join().expect("scanner panicked");
    }
}
