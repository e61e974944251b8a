#![forbid(unsafe_code)]

//! Per-node version locks.
//!
//! Every tree node carries a [`NodeVersion`]: one 64-bit word that is both a
//! spin lock for writers and a version stamp for optimistic readers. Readers
//! take a [`VersionStamp`] with [`NodeVersion::stable`], read the node, and
//! then ask [`NodeVersion::has_changed`] whether what they read is usable.
//! Writers hold a [`NodeLock`], mark the kind of change they are about to
//! make, and publish it by dropping the guard.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::thread;

const LOCK_BIT: u64 = 1 << 0;
const INSERTING_BIT: u64 = 1 << 1;
const SPLITTING_BIT: u64 = 1 << 2;
const DIRTY_MASK: u64 = INSERTING_BIT | SPLITTING_BIT;
const DELETED_BIT: u64 = 1 << 3;
const ROOT_BIT: u64 = 1 << 4;
const LEAF_BIT: u64 = 1 << 5;
const VINSERT_LOW: u64 = 1 << 8;
const VINSERT_MASK: u64 = ((1 << 24) - 1) << 8;
const VSPLIT_LOW: u64 = 1 << 32;
const VSPLIT_MASK: u64 = !((1 << 32) - 1);

/// Snapshot of a node's version word.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VersionStamp(u64);

impl VersionStamp {
    /// Raw bits, as handed to scan callbacks.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Whether the node is a leaf.
    pub fn is_leaf(self) -> bool {
        self.0 & LEAF_BIT != 0
    }

    /// Whether the node is the root of its layer.
    pub fn is_root(self) -> bool {
        self.0 & ROOT_BIT != 0
    }

    /// Whether the node has been unlinked from the tree.
    pub fn is_deleted(self) -> bool {
        self.0 & DELETED_BIT != 0
    }

    /// Whether a writer held the lock when the stamp was taken.
    pub fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    /// Whether a writer was mid-change when the stamp was taken.
    pub fn is_dirty(self) -> bool {
        self.0 & DIRTY_MASK != 0
    }

    /// Whether a split or delete separates `old` from this stamp.
    pub fn split_since(self, old: VersionStamp) -> bool {
        (self.0 ^ old.0) & (VSPLIT_MASK | SPLITTING_BIT | DELETED_BIT) != 0
    }
}

/// Lock and version word embedded in every node.
#[derive(Debug)]
pub struct NodeVersion {
    word: AtomicU64,
}

impl NodeVersion {
    /// Creates an unlocked version for a leaf or an internode.
    pub fn new(leaf: bool) -> Self {
        Self {
            word: AtomicU64::new(if leaf { LEAF_BIT } else { 0 }),
        }
    }

    /// Reinitializes the word for a node that no other thread can reach.
    ///
    /// Counters are kept so that a recycled node never repeats an old stamp.
    pub fn reset(&self, leaf: bool, root: bool) {
        let counters = self.word.load(Ordering::Relaxed) & (VINSERT_MASK | VSPLIT_MASK);
        let mut word = counters.wrapping_add(VSPLIT_LOW);
        if leaf {
            word |= LEAF_BIT;
        }
        if root {
            word |= ROOT_BIT;
        }
        self.word.store(word, Ordering::Release);
    }

    /// Current word without waiting for writers.
    pub fn load(&self) -> VersionStamp {
        VersionStamp(self.word.load(Ordering::Acquire))
    }

    /// Waits until no writer is mid-change and returns the stamp.
    pub fn stable(&self) -> VersionStamp {
        let mut backoff = Backoff::new();
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word & DIRTY_MASK == 0 {
                return VersionStamp(word);
            }
            backoff.snooze();
        }
    }

    /// Whether any change has been published or started since `old`.
    ///
    /// Lock acquisition alone does not count as a change.
    pub fn has_changed(&self, old: VersionStamp) -> bool {
        fence(Ordering::Acquire);
        let now = self.word.load(Ordering::Relaxed);
        (now ^ old.0) > LOCK_BIT
    }

    /// Whether the node has split, started splitting, or been deleted since `old`.
    pub fn has_split(&self, old: VersionStamp) -> bool {
        fence(Ordering::Acquire);
        VersionStamp(self.word.load(Ordering::Relaxed)).split_since(old)
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) -> NodeLock<'_> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff.snooze();
        }
    }

    /// Acquires the lock if it is free.
    pub fn try_lock(&self) -> Option<NodeLock<'_>> {
        let current = self.word.load(Ordering::Relaxed);
        if current & LOCK_BIT != 0 {
            return None;
        }
        self.word
            .compare_exchange_weak(
                current,
                current | LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| NodeLock { version: self })
    }
}

/// Exclusive hold on a [`NodeVersion`]. Dropping it publishes and unlocks.
#[derive(Debug)]
pub struct NodeLock<'a> {
    version: &'a NodeVersion,
}

impl<'a> NodeLock<'a> {
    /// Stamp of the locked word.
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp(self.version.word.load(Ordering::Relaxed))
    }

    /// Announces an in-place change (insert, remove, value overwrite).
    pub fn mark_insert(&mut self) {
        self.set_bits(INSERTING_BIT);
    }

    /// Announces a split; readers that overlap it see [`NodeVersion::has_split`].
    pub fn mark_split(&mut self) {
        self.set_bits(SPLITTING_BIT);
    }

    /// Marks the node unlinked. Readers and writers that reach it restart.
    pub fn mark_deleted(&mut self) {
        self.set_bits(DELETED_BIT | INSERTING_BIT);
    }

    /// Sets or clears the layer-root flag.
    pub fn set_root(&mut self, root: bool) {
        let word = self.version.word.load(Ordering::Relaxed);
        let next = if root {
            word | ROOT_BIT
        } else {
            word & !ROOT_BIT
        };
        self.version.word.store(next, Ordering::Release);
    }

    fn set_bits(&mut self, bits: u64) {
        let word = self.version.word.load(Ordering::Relaxed);
        self.version.word.store(word | bits, Ordering::Relaxed);
        fence(Ordering::Release);
    }
}

impl Drop for NodeLock<'_> {
    fn drop(&mut self) {
        let word = self.version.word.load(Ordering::Relaxed);
        let mut next = word;
        if word & INSERTING_BIT != 0 {
            next = (next & !VINSERT_MASK) | (next.wrapping_add(VINSERT_LOW) & VINSERT_MASK);
        }
        if word & SPLITTING_BIT != 0 {
            next = (next & !VSPLIT_MASK) | (next.wrapping_add(VSPLIT_LOW) & VSPLIT_MASK);
        }
        next &= !(LOCK_BIT | DIRTY_MASK);
        self.version.word.store(next, Ordering::Release);
    }
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Exponential spin, then yield.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Fresh backoff state.
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits a little longer than last time.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step < YIELD_LIMIT {
            self.step += 1;
        }
    }
}
