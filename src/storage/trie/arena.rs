//! Node storage with stable addresses.
//!
//! Nodes live in segments that double in size and are never moved or freed
//! while the arena lives, so a [`NodeId`] read by an optimistic reader always
//! names valid memory. Ids return to the free list only through epoch-deferred
//! reclamation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::node::{Node, NodeId, NIL};
use crate::types::NodeRef;

const FIRST_SEGMENT: u64 = 64;
const SEGMENTS: usize = 26;

/// Most nodes one arena can hand out.
pub(crate) const MAX_NODES: usize = (NIL - FIRST_SEGMENT as u32) as usize;

fn locate(id: NodeId) -> (usize, usize) {
    let n = u64::from(id) / FIRST_SEGMENT + 1;
    let segment = (63 - n.leading_zeros()) as usize;
    let base = FIRST_SEGMENT * ((1u64 << segment) - 1);
    (segment, (u64::from(id) - base) as usize)
}

fn segment_len(segment: usize) -> usize {
    (FIRST_SEGMENT << segment) as usize
}

/// Growable pool of [`Node`]s addressed by id.
#[derive(Debug)]
pub(crate) struct NodeArena {
    segments: [OnceLock<Box<[Node]>>; SEGMENTS],
    next: AtomicU32,
    free: Mutex<Vec<NodeId>>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| OnceLock::new()),
            next: AtomicU32::new(0),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocates the segments needed for the first `nodes` ids up front.
    pub(crate) fn reserve(&self, nodes: usize) {
        if nodes == 0 {
            return;
        }
        let last = NodeId::try_from(nodes - 1).unwrap_or(NIL - 1);
        let (segment, _) = locate(last);
        for seg in 0..=segment.min(SEGMENTS - 1) {
            self.segment(seg);
        }
    }

    fn segment(&self, segment: usize) -> &[Node] {
        self.segments[segment].get_or_init(|| (0..segment_len(segment)).map(|_| Node::new()).collect())
    }

    /// Node behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was never handed out by [`NodeArena::alloc`].
    pub(crate) fn get(&self, id: NodeId) -> &Node {
        let (segment, index) = locate(id);
        match self.segments.get(segment).and_then(OnceLock::get) {
            Some(nodes) => &nodes[index],
            None => panic!("{} is outside the arena", NodeRef(id)),
        }
    }

    /// Hands out a reset node, reusing reclaimed ids first.
    pub(crate) fn alloc(&self, leaf: bool, root: bool) -> NodeId {
        let id = match self.free.lock().pop() {
            Some(id) => id,
            None => {
                let id = self.next.fetch_add(1, Ordering::Relaxed);
                assert!((id as usize) < MAX_NODES, "node arena exhausted");
                let (segment, _) = locate(id);
                self.segment(segment);
                id
            }
        };
        self.get(id).reset(leaf, root);
        id
    }

    /// Returns `id` to the free list. The caller guarantees no thread can
    /// still reach the node.
    pub(crate) fn release(&self, id: NodeId) {
        debug_assert_ne!(id, NIL);
        self.free.lock().push(id);
    }

    /// Ids handed out so far, including recycled ones.
    pub(crate) fn allocated(&self) -> usize {
        self.next.load(Ordering::Relaxed) as usize
    }

    /// Ids waiting on the free list.
    pub(crate) fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}
