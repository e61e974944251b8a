//! Bounded forward and reverse range scans.
//!
//! A scan holds no locks. It keeps one frame per layer it is inside, and each
//! frame remembers where to resume as a key position rather than a slot, so
//! a leaf that splits or changes under the scan is simply read again. Every
//! leaf read is validated against the leaf's version stamp before any of its
//! entries are handed out.

use std::ops::Bound;

use smallvec::SmallVec;

use super::key::{push_slice, slice_of, LAYER, SLICE_LEN};
use super::node::{Entry, NodeId, NIL, WIDTH};
use super::tree::{Descend, Trie};
use crate::primitives::concurrency::VersionStamp;
use crate::types::{NodeRef, ValueHandle};

/// Receives the events of a scan, in traversal order.
pub trait ScanVisitor {
    /// Called once each time the scan arrives at a leaf, before any entry of
    /// that leaf. `version` is the stamp the leaf's contents were validated
    /// against.
    fn visit_node(&mut self, node: NodeRef, version: u64) {
        let _ = (node, version);
    }

    /// Called once per entry inside the range. Returning `false` ends the
    /// scan.
    fn visit_entry(&mut self, key: &[u8], value: ValueHandle) -> bool;
}

/// [`ScanVisitor`] built from a pair of closures.
pub struct ScanCallbacks<N, E> {
    on_node: N,
    on_entry: E,
}

fn ignore_node(_: NodeRef, _: u64) {}

impl<N, E> ScanCallbacks<N, E>
where
    N: FnMut(NodeRef, u64),
    E: FnMut(&[u8], ValueHandle) -> bool,
{
    /// Visitor that forwards node and entry events to the two closures.
    pub fn new(on_node: N, on_entry: E) -> Self {
        Self { on_node, on_entry }
    }
}

impl<E> ScanCallbacks<fn(NodeRef, u64), E>
where
    E: FnMut(&[u8], ValueHandle) -> bool,
{
    /// Visitor that only cares about entries.
    pub fn entries(on_entry: E) -> Self {
        Self {
            on_node: ignore_node,
            on_entry,
        }
    }
}

impl<N, E> ScanVisitor for ScanCallbacks<N, E>
where
    N: FnMut(NodeRef, u64),
    E: FnMut(&[u8], ValueHandle) -> bool,
{
    fn visit_node(&mut self, node: NodeRef, version: u64) {
        (self.on_node)(node, version)
    }

    fn visit_entry(&mut self, key: &[u8], value: ValueHandle) -> bool {
        (self.on_entry)(key, value)
    }
}

/// Converts an optional bound key and its exclusivity flag into a [`Bound`].
pub fn key_bound(key: Option<&[u8]>, exclusive: bool) -> Bound<&[u8]> {
    match key {
        None => Bound::Unbounded,
        Some(key) if exclusive => Bound::Excluded(key),
        Some(key) => Bound::Included(key),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    Forward,
    Reverse,
}

/// Where a frame continues within its layer.
#[derive(Copy, Clone, Debug)]
enum Resume<'k> {
    /// From the start of the layer in scan order.
    Open,
    /// From the bound whose remaining bytes are `rest`.
    Bound {
        ikey: u64,
        class: u8,
        inclusive: bool,
        rest: &'k [u8],
    },
    /// Strictly past `(ikey, class)` in scan order.
    Past { ikey: u64, class: u8 },
}

impl<'k> Resume<'k> {
    fn from_bound(bound: Bound<&'k [u8]>) -> Self {
        let (rest, inclusive) = match bound {
            Bound::Unbounded => return Resume::Open,
            Bound::Included(rest) => (rest, true),
            Bound::Excluded(rest) => (rest, false),
        };
        let (ikey, class) = slice_of(rest);
        Resume::Bound {
            ikey,
            class,
            inclusive,
            rest,
        }
    }

    fn admits(&self, dir: Direction, entry: (u64, u8)) -> bool {
        let (point, inclusive) = match *self {
            Resume::Open => return true,
            Resume::Bound {
                ikey,
                class,
                inclusive,
                ..
            } => ((ikey, class), inclusive || class == LAYER),
            Resume::Past { ikey, class } => ((ikey, class), false),
        };
        match dir {
            Direction::Forward => entry > point || (inclusive && entry == point),
            Direction::Reverse => entry < point || (inclusive && entry == point),
        }
    }

    /// Resume point for the layer linked by `link`.
    fn below(&self, link: (u64, u8)) -> Resume<'k> {
        match *self {
            Resume::Bound {
                ikey,
                class: LAYER,
                inclusive,
                rest,
            } if (ikey, LAYER) == link => Resume::from_bound(if inclusive {
                Bound::Included(&rest[SLICE_LEN..])
            } else {
                Bound::Excluded(&rest[SLICE_LEN..])
            }),
            _ => Resume::Open,
        }
    }

    /// Slice the scan must be positioned at to see the next admitted entry.
    fn target(&self, dir: Direction) -> u64 {
        match (*self, dir) {
            (Resume::Open, Direction::Forward) => 0,
            (Resume::Open, Direction::Reverse) => u64::MAX,
            (Resume::Bound { ikey, .. }, _) => ikey,
            (Resume::Past { ikey, .. }, Direction::Forward) => ikey,
            (Resume::Past { ikey, class }, Direction::Reverse) => {
                if class == 0 {
                    ikey.saturating_sub(1)
                } else {
                    ikey
                }
            }
        }
    }
}

#[derive(Debug)]
struct Frame<'k> {
    leaf: NodeId,
    resume: Resume<'k>,
    announced: bool,
}

struct Snapshot {
    stamp: VersionStamp,
    entries: SmallVec<[Entry; WIDTH]>,
    low: u64,
    next: NodeId,
    prev: NodeId,
}

/// What the top frame does after one leaf visit.
enum Step<'k> {
    /// Keep going with the frame's updated leaf and resume point.
    Stay,
    /// The layer is exhausted.
    Leave,
    /// Enter the layer linked under slice `ikey`.
    Enter {
        link: NodeId,
        ikey: u64,
        resume: Resume<'k>,
    },
}

fn within(dir: Direction, key: &[u8], stop: Bound<&[u8]>) -> bool {
    match (dir, stop) {
        (_, Bound::Unbounded) => true,
        (Direction::Forward, Bound::Included(bound)) => key <= bound,
        (Direction::Forward, Bound::Excluded(bound)) => key < bound,
        (Direction::Reverse, Bound::Included(bound)) => key >= bound,
        (Direction::Reverse, Bound::Excluded(bound)) => key > bound,
    }
}

impl Trie {
    /// Visits entries in ascending key order from `lower` until `upper`,
    /// the visitor, or `limit` ends the scan. Returns the number of entries
    /// delivered. The caller must be pinned.
    pub(crate) fn scan<V: ScanVisitor + ?Sized>(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        visitor: &mut V,
        limit: Option<usize>,
    ) -> usize {
        self.traverse(Direction::Forward, lower, upper, visitor, limit)
    }

    /// Mirror of [`Trie::scan`]: descending order from `upper` down to
    /// `lower`.
    pub(crate) fn rscan<V: ScanVisitor + ?Sized>(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        visitor: &mut V,
        limit: Option<usize>,
    ) -> usize {
        self.traverse(Direction::Reverse, upper, lower, visitor, limit)
    }

    fn first_leaf(&self, start: NodeId, target: u64) -> Option<NodeId> {
        match self.reach_leaf(start, target) {
            Descend::Leaf(leaf, _) => Some(leaf),
            Descend::Gone => None,
        }
    }

    /// Reads the entries of the frame's leaf that its resume point admits,
    /// in scan order. `None` when the leaf's layer was collected.
    fn snapshot(&self, frame: &Frame<'_>, dir: Direction) -> Option<Snapshot> {
        let node = self.node(frame.leaf);
        let mut stamp = node.version.stable();
        loop {
            if stamp.is_deleted() {
                return None;
            }
            let perm = node.permutation();
            let mut entries: SmallVec<[Entry; WIDTH]> = node
                .sorted_entries(perm)
                .filter(|e| frame.resume.admits(dir, (e.ikey, e.class)))
                .collect();
            let (low, next, prev) = (node.low_ikey(), node.next(), node.prev());
            if !node.version.has_changed(stamp) {
                if dir == Direction::Reverse {
                    entries.reverse();
                }
                return Some(Snapshot {
                    stamp,
                    entries,
                    low,
                    next,
                    prev,
                });
            }
            self.stats.inc_scan_retries();
            stamp = node.version.stable();
        }
    }

    fn traverse<V: ScanVisitor + ?Sized>(
        &self,
        dir: Direction,
        from: Bound<&[u8]>,
        stop: Bound<&[u8]>,
        visitor: &mut V,
        limit: Option<usize>,
    ) -> usize {
        if limit == Some(0) {
            return 0;
        }
        let mut delivered = 0usize;
        let mut prefix: Vec<u8> = Vec::new();
        let mut key: Vec<u8> = Vec::new();
        let mut frames: SmallVec<[Frame<'_>; 4]> = SmallVec::new();

        let resume = Resume::from_bound(from);
        if let Some(leaf) = self.first_leaf(self.root, resume.target(dir)) {
            frames.push(Frame {
                leaf,
                resume,
                announced: false,
            });
        }

        while let Some(frame) = frames.last_mut() {
            let step = match self.snapshot(frame, dir) {
                None => Step::Leave,
                Some(snap)
                    if dir == Direction::Reverse
                        && snap.next != NIL
                        && self.node(snap.next).low_ikey() <= frame.resume.target(dir) =>
                {
                    // the leaf split after we picked it
                    frame.leaf = snap.next;
                    frame.announced = false;
                    Step::Stay
                }
                Some(snap) => {
                    if !frame.announced {
                        visitor.visit_node(NodeRef(frame.leaf), snap.stamp.raw());
                        frame.announced = true;
                    }
                    let mut step = None;
                    for entry in &snap.entries {
                        let point = (entry.ikey, entry.class);
                        if entry.class == LAYER {
                            let below = frame.resume.below(point);
                            frame.resume = Resume::Past {
                                ikey: entry.ikey,
                                class: entry.class,
                            };
                            step = Some(Step::Enter {
                                link: entry.value as NodeId,
                                ikey: entry.ikey,
                                resume: below,
                            });
                            break;
                        }
                        key.clear();
                        key.extend_from_slice(&prefix);
                        push_slice(&mut key, entry.ikey, entry.class);
                        if !within(dir, &key, stop) {
                            return delivered;
                        }
                        frame.resume = Resume::Past {
                            ikey: entry.ikey,
                            class: entry.class,
                        };
                        delivered += 1;
                        if !visitor.visit_entry(&key, ValueHandle(entry.value))
                            || Some(delivered) == limit
                        {
                            return delivered;
                        }
                    }
                    match step {
                        Some(step) => step,
                        None => self.neighbour(frame, &snap, dir),
                    }
                }
            };
            match step {
                Step::Stay => {}
                Step::Leave => {
                    frames.pop();
                    prefix.truncate(prefix.len().saturating_sub(SLICE_LEN));
                }
                Step::Enter { link, ikey, resume } => {
                    if let Some(leaf) = self.first_leaf(link, resume.target(dir)) {
                        prefix.extend_from_slice(&ikey.to_be_bytes());
                        frames.push(Frame {
                            leaf,
                            resume,
                            announced: false,
                        });
                    }
                }
            }
        }
        delivered
    }

    /// Moves an exhausted frame to the adjacent leaf in scan order.
    fn neighbour<'k>(&self, frame: &mut Frame<'k>, snap: &Snapshot, dir: Direction) -> Step<'k> {
        let (leaf, resume) = match dir {
            Direction::Forward => (snap.next, frame.resume),
            // everything admitted at or above `low` has been delivered
            Direction::Reverse => (
                snap.prev,
                Resume::Past {
                    ikey: snap.low,
                    class: 0,
                },
            ),
        };
        if leaf == NIL {
            return Step::Leave;
        }
        frame.leaf = leaf;
        frame.resume = resume;
        frame.announced = false;
        Step::Stay
    }
}
