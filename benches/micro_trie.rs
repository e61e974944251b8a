//! Micro benchmarks for the in-memory trie index.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::ops::Bound;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use triekv::{KeyCodec, ScanCallbacks, Table, TableOptions, ThreadHandle, ValueHandle};

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: usize = 512;

fn encode(key: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    u64::encode_key(&key, &mut out);
    out
}

fn micro_trie(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/trie");
    group.sample_size(30);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTable::new,
            |fresh| {
                fresh.insert_keys(0..INSERT_COUNT);
                black_box(fresh.table.stats_snapshot().leaf_splits);
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTable::new,
            |fresh| {
                fresh.insert_keys(random_keys.iter().copied());
                black_box(fresh.table.stats_snapshot().leaf_splits);
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("long_key_insert", |b| {
        b.iter_batched(
            FreshTable::new,
            |fresh| {
                for &key in &random_keys {
                    let mut long = format!("user/{:08}/profile", key % 4_096).into_bytes();
                    long.extend_from_slice(&encode(key));
                    fresh.table.insert(&fresh.me, &long, ValueHandle(key as usize));
                }
                black_box(fresh.table.stats_snapshot().layers_created);
            },
            BatchSize::SmallInput,
        );
    });

    let mut loaded = LoadedTable::new(INSERT_COUNT);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| loaded.point_lookup(LOOKUP_SAMPLES));
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH as u64));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_scan(RANGE_WIDTH, false));
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH as u64));
    group.bench_function(BenchmarkId::new("reverse_scan", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_scan(RANGE_WIDTH, true));
    });

    group.finish();
}

struct FreshTable {
    table: Table,
    me: ThreadHandle,
}

impl FreshTable {
    fn new() -> Self {
        let table = Table::with_options(TableOptions::default().reclaim_batch(1024)).expect("bench options");
        let me = table.register(0);
        Self { table, me }
    }

    fn insert_keys(&self, keys: impl IntoIterator<Item = u64>) {
        for key in keys {
            self.table.insert(&self.me, &encode(key), ValueHandle(key as usize));
        }
    }
}

struct LoadedTable {
    fresh: FreshTable,
    len: u64,
    rng: ChaCha8Rng,
}

impl LoadedTable {
    fn new(len: u64) -> Self {
        let fresh = FreshTable::new();
        fresh.insert_keys(0..len);
        Self {
            fresh,
            len,
            rng: ChaCha8Rng::seed_from_u64(0xABCD_1234),
        }
    }

    fn point_lookup(&mut self, samples: usize) {
        let FreshTable { table, me } = &self.fresh;
        for _ in 0..samples {
            let key = self.rng.gen_range(0..self.len);
            black_box(table.get(me, &encode(key)));
        }
    }

    fn range_scan(&mut self, width: usize, reverse: bool) {
        let FreshTable { table, me } = &self.fresh;
        let start = encode(self.rng.gen_range(0..self.len));
        let mut seen = 0usize;
        let mut visitor = ScanCallbacks::entries(|_: &[u8], value: ValueHandle| {
            black_box(value);
            seen += 1;
            true
        });
        let delivered = if reverse {
            table.rscan(me, Bound::Unbounded, Bound::Included(&start[..]), &mut visitor, Some(width))
        } else {
            table.scan(me, Bound::Included(&start[..]), Bound::Unbounded, &mut visitor, Some(width))
        };
        black_box((delivered, seen));
    }
}

criterion_group!(benches, micro_trie);
criterion_main!(benches);
