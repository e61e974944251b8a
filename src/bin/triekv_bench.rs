//! Multi-threaded load driver for triekv.
//!
//! Two workloads:
//! - `counter`: threads pull dense integer keys from a shared counter and
//!   insert them, then a full scan checks the result. Optional update and
//!   remove phases follow.
//! - `random`: a fixed set of shuffled keys with random-length values is
//!   partitioned across threads, inserted in parallel and verified.

use std::error::Error;
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;
use triekv::{KeyCodec, NodeRef, ScanCallbacks, Table, TableOptions, ValueHandle};

fn main() {
    init_tracing();
    if let Err(err) = try_main() {
        eprintln!("triekv-bench failed: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("triekv=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let table = Table::with_options(TableOptions::benchmark().reclaim_batch(cli.reclaim_batch))?;
    match cli.command {
        Command::Counter(args) => run_counter(&table, &args)?,
        Command::Random(args) => run_random(&table, &args)?,
    }
    table.emit_stats();
    let (allocated, free) = table.arena_usage();
    println!("\nSTATS");
    println!("{:#?}", table.stats_snapshot());
    println!("arena nodes: {allocated} allocated, {free} free");
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "triekv-bench", about = "Concurrent load driver for the triekv index")]
struct Cli {
    /// Deferred reclamations each thread buffers before advancing the epoch.
    #[arg(long, default_value_t = 1024, global = true)]
    reclaim_batch: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert dense integer keys drawn from a shared counter.
    Counter(CounterArgs),
    /// Insert shuffled fixed-size keys with random-length values.
    Random(RandomArgs),
}

#[derive(Args, Debug)]
struct CounterArgs {
    /// Worker threads (defaults to available parallelism).
    #[arg(long)]
    threads: Option<usize>,

    /// Largest key inserted.
    #[arg(long, default_value_t = 0xffff)]
    max_key: u64,

    /// Run an update phase over every key after inserting.
    #[arg(long)]
    update: bool,

    /// Run a remove phase over every key at the end.
    #[arg(long)]
    remove: bool,
}

#[derive(Args, Debug)]
struct RandomArgs {
    /// Number of distinct keys.
    #[arg(long, default_value_t = 1_000_000)]
    keys: usize,

    /// Key length in bytes; the first eight bytes carry the key id.
    #[arg(long, default_value_t = 8)]
    key_size: usize,

    /// Shortest value in bytes.
    #[arg(long, default_value_t = 8)]
    val_min: usize,

    /// Longest value in bytes.
    #[arg(long, default_value_t = 64)]
    val_max: usize,

    /// Worker threads (defaults to available parallelism).
    #[arg(long)]
    threads: Option<usize>,

    /// Hand each thread a contiguous sorted range instead of shuffled keys.
    #[arg(long)]
    sorted: bool,

    /// RNG seed for repeatable runs.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn thread_count(requested: Option<usize>) -> usize {
    requested
        .filter(|&n| n > 0)
        .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
}

fn encode(key: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    u64::encode_key(&key, &mut out);
    out
}

fn report(phase: &str, threads: usize, ops: u64, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{:<10} {:>8} {:>12} {:>12.2} ms {:>14.0} ops/s",
        phase,
        threads,
        ops,
        elapsed.as_secs_f64() * 1_000.0,
        ops as f64 / secs
    );
    info!(phase, threads, ops, elapsed_ms = elapsed.as_millis() as u64, "phase finished");
}

/// Runs `work` for every key the shared counter hands out, on `threads`
/// registered threads.
fn counter_phase<F>(table: &Table, threads: usize, max_key: u64, work: F) -> Duration
where
    F: Fn(&Table, &triekv::ThreadHandle, u64) + Sync,
{
    let next = AtomicU64::new(0);
    let start = Instant::now();
    thread::scope(|scope| {
        for t in 0..threads {
            let (next, work) = (&next, &work);
            scope.spawn(move || {
                let me = table.register(t);
                loop {
                    let key = next.fetch_add(1, Ordering::Relaxed);
                    if key > max_key {
                        break;
                    }
                    work(table, &me, key);
                }
            });
        }
    });
    start.elapsed()
}

fn run_counter(table: &Table, args: &CounterArgs) -> Result<(), Box<dyn Error>> {
    let threads = thread_count(args.threads);
    let total = args.max_key + 1;
    println!("{:<10} {:>8} {:>12} {:>15} {:>18}", "PHASE", "THREADS", "KEYS", "TIME", "THROUGHPUT");

    let elapsed = counter_phase(table, threads, args.max_key, |table, me, key| {
        assert!(table.insert(me, &encode(key), ValueHandle::NULL), "key {key} inserted twice");
    });
    report("insert", threads, total, elapsed);

    let me = table.main_context();
    let mut nodes = 0u64;
    let mut entries = 0u64;
    let start = Instant::now();
    let mut visitor = ScanCallbacks::new(
        |_: NodeRef, _: u64| nodes += 1,
        |_: &[u8], _: ValueHandle| {
            entries += 1;
            true
        },
    );
    table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut visitor, None);
    drop(visitor);
    report("scan", 1, entries, start.elapsed());
    println!("scan visited {nodes} leaves");
    if entries != total {
        return Err(format!("scan found {entries} entries, expected {total}").into());
    }

    if args.update {
        let elapsed = counter_phase(table, threads, args.max_key, |table, me, key| {
            assert!(table.update(me, &encode(key), ValueHandle(key as usize)), "key {key} missing on update");
        });
        report("update", threads, total, elapsed);
    }

    if args.remove {
        let elapsed = counter_phase(table, threads, args.max_key, |table, me, key| {
            assert!(table.remove(me, &encode(key)), "key {key} missing on remove");
        });
        report("remove", threads, total, elapsed);
        let mut left = 0usize;
        let mut visitor = ScanCallbacks::entries(|_: &[u8], _| {
            left += 1;
            true
        });
        table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut visitor, None);
        if left != 0 {
            return Err(format!("{left} entries survived the remove phase").into());
        }
    }
    table.quiesce(&me);
    Ok(())
}

fn run_random(table: &Table, args: &RandomArgs) -> Result<(), Box<dyn Error>> {
    if args.key_size < 8 {
        return Err("--key-size must be at least 8".into());
    }
    if args.val_min > args.val_max {
        return Err("--val-min must not exceed --val-max".into());
    }
    let threads = thread_count(args.threads);
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);

    let keys: Vec<Vec<u8>> = (0..args.keys as u64)
        .map(|id| {
            let mut key = encode(id);
            key.extend((8..args.key_size).map(|_| rng.gen::<u8>()));
            key
        })
        .collect();
    let values: Vec<Vec<u8>> = (0..args.keys)
        .map(|_| {
            let len = rng.gen_range(args.val_min..=args.val_max);
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect();
    let mut order: Vec<usize> = (0..args.keys).collect();
    if !args.sorted {
        order.shuffle(&mut rng);
    }
    let chunk = args.keys.div_ceil(threads).max(1);

    println!("{:<10} {:>8} {:>12} {:>15} {:>18}", "PHASE", "THREADS", "KEYS", "TIME", "THROUGHPUT");
    let start = Instant::now();
    thread::scope(|scope| {
        for (t, part) in order.chunks(chunk).enumerate() {
            let (keys, values) = (&keys, &values);
            scope.spawn(move || {
                let me = table.register(t);
                for &i in part {
                    let handle = ValueHandle::from_ptr(values[i].as_ptr());
                    assert!(table.insert(&me, &keys[i], handle), "duplicate key id {i}");
                }
            });
        }
    });
    report("insert", threads, args.keys as u64, start.elapsed());

    let me = table.main_context();
    let start = Instant::now();
    for (i, key) in keys.iter().enumerate() {
        let found = table.get(&me, key).ok_or_else(|| format!("key id {i} missing"))?;
        if found.as_ptr::<u8>() != values[i].as_ptr() {
            return Err(format!("key id {i} maps to the wrong value").into());
        }
    }
    report("verify", 1, args.keys as u64, start.elapsed());
    Ok(())
}
