//! Fixed-fanout tree nodes.
//!
//! One node type serves both roles. A leaf holds up to [`WIDTH`] entries in
//! unordered slots and publishes their sorted order through a single
//! permutation word, so an insert or remove becomes visible with one atomic
//! store. An internode holds up to [`WIDTH`] separator slices and
//! `WIDTH + 1` children; its key count lives in the low nibble of the same
//! word. Every field is an atomic so optimistic readers never race.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::primitives::concurrency::NodeVersion;

/// Entries per leaf and separators per internode.
pub(crate) const WIDTH: usize = 15;

/// Index of a node in the arena.
pub(crate) type NodeId = u32;

/// Absent link.
pub(crate) const NIL: NodeId = NodeId::MAX;

/// Sorted order of a leaf's slots.
///
/// Bits `0..4` hold the entry count. Nibble `i + 1` holds the slot of the
/// `i`-th smallest entry; nibbles past the count list the free slots.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct Permuter(u64);

impl Permuter {
    pub(crate) fn empty() -> Self {
        let mut order = [0u8; WIDTH];
        for (pos, slot) in order.iter_mut().enumerate() {
            *slot = pos as u8;
        }
        Self::encode(&order, 0)
    }

    fn encode(order: &[u8; WIDTH], size: usize) -> Self {
        let mut word = size as u64;
        for (pos, &slot) in order.iter().enumerate() {
            word |= u64::from(slot) << (4 * (pos + 1));
        }
        Self(word)
    }

    fn decode(self) -> [u8; WIDTH] {
        let mut order = [0u8; WIDTH];
        for (pos, slot) in order.iter_mut().enumerate() {
            *slot = self.get(pos) as u8;
        }
        order
    }

    /// Builds a permutation whose sorted slots are `live`; every other slot
    /// is free.
    pub(crate) fn from_live(live: &[u8]) -> Self {
        debug_assert!(live.len() <= WIDTH);
        let mut order = [0u8; WIDTH];
        let mut used = [false; WIDTH];
        order[..live.len()].copy_from_slice(live);
        for &slot in live {
            used[usize::from(slot)] = true;
        }
        let free = (0..WIDTH as u8).filter(|slot| !used[usize::from(*slot)]);
        for (dst, slot) in order[live.len()..].iter_mut().zip(free) {
            *dst = slot;
        }
        Self::encode(&order, live.len())
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn size(self) -> usize {
        (self.0 & 0xf) as usize
    }

    /// Slot of the `pos`-th smallest entry.
    pub(crate) fn get(self, pos: usize) -> usize {
        ((self.0 >> (4 * (pos + 1))) & 0xf) as usize
    }

    /// Claims the first free slot for an entry at sorted position `pos`.
    pub(crate) fn insert(self, pos: usize) -> (Self, usize) {
        let size = self.size();
        debug_assert!(size < WIDTH && pos <= size);
        let mut order = self.decode();
        let slot = order[size];
        order.copy_within(pos..size, pos + 1);
        order[pos] = slot;
        (Self::encode(&order, size + 1), usize::from(slot))
    }

    /// Drops the entry at sorted position `pos`, freeing its slot.
    pub(crate) fn remove(self, pos: usize) -> Self {
        let size = self.size();
        debug_assert!(pos < size);
        let mut order = self.decode();
        let slot = order[pos];
        order.copy_within(pos + 1..size, pos);
        order[size - 1] = slot;
        Self::encode(&order, size - 1)
    }
}

/// Leaf entry as seen by splits and scans.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Entry {
    pub(crate) ikey: u64,
    pub(crate) class: u8,
    pub(crate) value: usize,
}

/// A tree node. See the module docs for the two layouts.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) version: NodeVersion,
    perm: AtomicU64,
    low_ikey: AtomicU64,
    next: AtomicU32,
    prev: AtomicU32,
    parent: AtomicU32,
    ikeys: [AtomicU64; WIDTH],
    classes: [AtomicU8; WIDTH],
    slots: [AtomicUsize; WIDTH + 1],
}

impl Node {
    pub(crate) fn new() -> Self {
        Self {
            version: NodeVersion::new(true),
            perm: AtomicU64::new(Permuter::empty().raw()),
            low_ikey: AtomicU64::new(0),
            next: AtomicU32::new(NIL),
            prev: AtomicU32::new(NIL),
            parent: AtomicU32::new(NIL),
            ikeys: std::array::from_fn(|_| AtomicU64::new(0)),
            classes: std::array::from_fn(|_| AtomicU8::new(0)),
            slots: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Reinitializes a node that no other thread can reach.
    pub(crate) fn reset(&self, leaf: bool, root: bool) {
        let perm = if leaf { Permuter::empty().raw() } else { 0 };
        self.perm.store(perm, Ordering::Relaxed);
        self.low_ikey.store(0, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Relaxed);
        self.prev.store(NIL, Ordering::Relaxed);
        self.parent.store(NIL, Ordering::Relaxed);
        self.version.reset(leaf, root);
    }

    pub(crate) fn low_ikey(&self) -> u64 {
        self.low_ikey.load(Ordering::Acquire)
    }

    pub(crate) fn set_low_ikey(&self, ikey: u64) {
        self.low_ikey.store(ikey, Ordering::Release);
    }

    pub(crate) fn next(&self) -> NodeId {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, id: NodeId) {
        self.next.store(id, Ordering::Release);
    }

    pub(crate) fn prev(&self) -> NodeId {
        self.prev.load(Ordering::Acquire)
    }

    pub(crate) fn set_prev(&self, id: NodeId) {
        self.prev.store(id, Ordering::Release);
    }

    pub(crate) fn parent(&self) -> NodeId {
        self.parent.load(Ordering::Acquire)
    }

    pub(crate) fn set_parent(&self, id: NodeId) {
        self.parent.store(id, Ordering::Release);
    }

    // leaf layout

    pub(crate) fn permutation(&self) -> Permuter {
        Permuter(self.perm.load(Ordering::Acquire))
    }

    pub(crate) fn set_permutation(&self, perm: Permuter) {
        self.perm.store(perm.raw(), Ordering::Release);
    }

    pub(crate) fn entry(&self, slot: usize) -> Entry {
        Entry {
            ikey: self.ikeys[slot].load(Ordering::Relaxed),
            class: self.classes[slot].load(Ordering::Relaxed),
            value: self.slots[slot].load(Ordering::Acquire),
        }
    }

    pub(crate) fn write_entry(&self, slot: usize, entry: Entry) {
        self.ikeys[slot].store(entry.ikey, Ordering::Relaxed);
        self.classes[slot].store(entry.class, Ordering::Relaxed);
        self.slots[slot].store(entry.value, Ordering::Relaxed);
    }

    pub(crate) fn value(&self, slot: usize) -> usize {
        self.slots[slot].load(Ordering::Acquire)
    }

    pub(crate) fn set_value(&self, slot: usize, value: usize) {
        self.slots[slot].store(value, Ordering::Release);
    }

    /// First sorted position whose entry is not below `(ikey, class)`, and
    /// whether that entry matches exactly.
    pub(crate) fn lower_bound(&self, perm: Permuter, ikey: u64, class: u8) -> (usize, bool) {
        let target = (ikey, class);
        for pos in 0..perm.size() {
            let slot = perm.get(pos);
            let here = (
                self.ikeys[slot].load(Ordering::Relaxed),
                self.classes[slot].load(Ordering::Relaxed),
            );
            if here >= target {
                return (pos, here == target);
            }
        }
        (perm.size(), false)
    }

    /// Entries in sorted order.
    pub(crate) fn sorted_entries(&self, perm: Permuter) -> impl Iterator<Item = Entry> + '_ {
        (0..perm.size()).map(move |pos| self.entry(perm.get(pos)))
    }

    // internode layout

    pub(crate) fn key_count(&self) -> usize {
        (self.perm.load(Ordering::Acquire) & 0xf) as usize
    }

    pub(crate) fn separator(&self, index: usize) -> u64 {
        self.ikeys[index].load(Ordering::Relaxed)
    }

    pub(crate) fn child(&self, index: usize) -> NodeId {
        self.slots[index].load(Ordering::Acquire) as NodeId
    }

    /// Child whose subtree covers `ikey`.
    pub(crate) fn child_for(&self, ikey: u64) -> NodeId {
        let count = self.key_count();
        let index = (0..count)
            .take_while(|&i| self.separator(i) <= ikey)
            .count();
        self.child(index)
    }

    /// Overwrites the internode with `separators` and `children`.
    pub(crate) fn fill_internode(&self, separators: &[u64], children: &[NodeId]) {
        debug_assert_eq!(separators.len() + 1, children.len());
        debug_assert!(separators.len() <= WIDTH);
        for (i, sep) in separators.iter().enumerate() {
            self.ikeys[i].store(*sep, Ordering::Relaxed);
        }
        for (i, child) in children.iter().enumerate() {
            self.slots[i].store(*child as usize, Ordering::Relaxed);
        }
        self.perm.store(separators.len() as u64, Ordering::Release);
    }

    /// Separators and children of an internode.
    pub(crate) fn internode_contents(&self) -> (Vec<u64>, Vec<NodeId>) {
        let count = self.key_count();
        let separators = (0..count).map(|i| self.separator(i)).collect();
        let children = (0..=count).map(|i| self.child(i)).collect();
        (separators, children)
    }

    /// Inserts `separator` with `right` as the child just after it. The
    /// internode must have room.
    pub(crate) fn internode_insert(&self, separator: u64, right: NodeId) {
        let count = self.key_count();
        debug_assert!(count < WIDTH);
        let index = (0..count)
            .take_while(|&i| self.separator(i) <= separator)
            .count();
        for i in (index..count).rev() {
            self.ikeys[i + 1].store(self.separator(i), Ordering::Relaxed);
            self.slots[i + 2].store(self.child(i + 1) as usize, Ordering::Relaxed);
        }
        self.ikeys[index].store(separator, Ordering::Relaxed);
        self.slots[index + 1].store(right as usize, Ordering::Relaxed);
        self.perm.store(count as u64 + 1, Ordering::Release);
    }
}
