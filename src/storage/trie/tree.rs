//! Layered B-link tree engine.
//!
//! Every layer is a B-link tree over 8-byte slices. Leaves split to the
//! right and are chained through `next`/`prev`, so a reader that lands on a
//! leaf that has since split walks right until the leaf's range covers its
//! slice. Writers lock leaves left to right and then climb to internodes;
//! a splitting node stays locked until its separator is in the parent.
//!
//! A layer is referenced by the node it started with. That node is the
//! layer's leftmost leaf forever, and the current root is found by climbing
//! parent links from it.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::arena::NodeArena;
use super::key::{slice_of, LAYER, SLICE_LEN};
use super::node::{Entry, Node, NodeId, Permuter, NIL, WIDTH};
use super::stats::TrieStats;
use crate::primitives::concurrency::{NodeLock, VersionStamp};
use crate::primitives::thread::ThreadContext;

/// Outcome of an optimistic descent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Descend {
    /// Leaf reached, with the stamp its contents must be validated against.
    Leaf(NodeId, VersionStamp),
    /// The layer was collected while we were looking at it.
    Gone,
}

#[derive(Debug)]
pub(crate) struct Trie {
    pub(crate) arena: Arc<NodeArena>,
    pub(crate) root: NodeId,
    pub(crate) stats: Arc<TrieStats>,
}

impl Trie {
    pub(crate) fn new(reserve: usize, stats: Arc<TrieStats>) -> Self {
        let arena = Arc::new(NodeArena::new());
        arena.reserve(reserve);
        let root = arena.alloc(true, true);
        Self { arena, root, stats }
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.arena.get(id)
    }

    fn reach_root(&self, start: NodeId) -> NodeId {
        let mut id = start;
        loop {
            let node = self.node(id);
            let parent = node.parent();
            if node.version.load().is_root() || parent == NIL {
                return id;
            }
            id = parent;
        }
    }

    /// Optimistically descends the layer that starts at `start` to the leaf
    /// covering `ikey`. The leaf may have split since; see [`Trie::walk_right`].
    pub(crate) fn reach_leaf(&self, start: NodeId, ikey: u64) -> Descend {
        'retry: loop {
            let mut id = self.reach_root(start);
            let mut node = self.node(id);
            let mut stamp = node.version.stable();
            if stamp.is_deleted() {
                return Descend::Gone;
            }
            if !stamp.is_root() {
                continue 'retry;
            }
            loop {
                if stamp.is_leaf() {
                    return Descend::Leaf(id, stamp);
                }
                let child = node.child_for(ikey);
                // the child id is garbage unless the internode is unchanged
                if node.version.has_changed(stamp) {
                    let now = node.version.stable();
                    if now.split_since(stamp) {
                        continue 'retry;
                    }
                    stamp = now;
                    continue;
                }
                let child_node = self.node(child);
                let child_stamp = child_node.version.stable();
                if node.version.has_changed(stamp) {
                    let now = node.version.stable();
                    if now.split_since(stamp) {
                        continue 'retry;
                    }
                    stamp = now;
                    continue;
                }
                id = child;
                node = child_node;
                stamp = child_stamp;
            }
        }
    }

    /// Follows `next` links while the right sibling's range starts at or
    /// below `ikey`.
    pub(crate) fn walk_right(
        &self,
        mut id: NodeId,
        mut stamp: VersionStamp,
        ikey: u64,
    ) -> (NodeId, VersionStamp) {
        loop {
            let next = self.node(id).next();
            if next == NIL || ikey < self.node(next).low_ikey() {
                return (id, stamp);
            }
            id = next;
            stamp = self.node(id).version.stable();
        }
    }

    /// Locks the leaf covering `ikey` in the layer that starts at `start`.
    ///
    /// Returns `None` when the layer was collected; callers restart from the
    /// top layer.
    pub(crate) fn locked_leaf(&self, start: NodeId, ikey: u64) -> Option<(NodeId, NodeLock<'_>)> {
        let Descend::Leaf(mut id, _) = self.reach_leaf(start, ikey) else {
            return None;
        };
        let mut guard = self.node(id).version.lock();
        loop {
            if guard.stamp().is_deleted() {
                return None;
            }
            let next = self.node(id).next();
            if next == NIL || ikey < self.node(next).low_ikey() {
                return Some((id, guard));
            }
            let next_guard = self.node(next).version.lock();
            guard = next_guard;
            id = next;
        }
    }

    /// Allocates the single leaf of a new layer.
    pub(crate) fn new_layer(&self) -> NodeId {
        let id = self.arena.alloc(true, true);
        self.stats.inc_layers_created();
        trace!(node = id, "created layer");
        id
    }

    /// Inserts `entry` at sorted position `pos` of the locked `leaf`,
    /// splitting when the leaf is full. Consumes the lock.
    pub(crate) fn insert_at<'a>(&'a self, mut guard: NodeLock<'a>, leaf: NodeId, pos: usize, entry: Entry) {
        let node = self.node(leaf);
        let perm = node.permutation();
        if perm.size() < WIDTH {
            let (next, slot) = perm.insert(pos);
            guard.mark_insert();
            node.write_entry(slot, entry);
            fence(Ordering::Release);
            node.set_permutation(next);
            return;
        }
        self.split_leaf(guard, leaf, pos, entry);
    }

    fn split_leaf<'a>(&'a self, mut guard: NodeLock<'a>, leaf: NodeId, pos: usize, entry: Entry) {
        let node = self.node(leaf);
        let perm = node.permutation();
        let mut all: SmallVec<[(Entry, Option<usize>); WIDTH + 1]> = (0..perm.size())
            .map(|p| {
                let slot = perm.get(p);
                (node.entry(slot), Some(slot))
            })
            .collect();
        all.insert(pos, (entry, None));
        let ikeys: SmallVec<[u64; WIDTH + 1]> = all.iter().map(|(e, _)| e.ikey).collect();
        let mid = split_point(&ikeys, pos);

        let right = self.arena.alloc(true, false);
        let right_node = self.node(right);
        let right_guard = right_node.version.lock();
        let moved = all.len() - mid;
        for (slot, (e, _)) in all[mid..].iter().enumerate() {
            right_node.write_entry(slot, *e);
        }
        let order: SmallVec<[u8; WIDTH]> = (0..moved as u8).collect();
        right_node.set_permutation(Permuter::from_live(&order));
        let separator = ikeys[mid];
        let old_next = node.next();
        right_node.set_low_ikey(separator);
        right_node.set_parent(node.parent());
        right_node.set_next(old_next);
        right_node.set_prev(leaf);

        guard.mark_split();
        node.set_next(right);
        if old_next != NIL {
            self.node(old_next).set_prev(right);
        }
        let mut spare = all[mid..].iter().filter_map(|(_, slot)| *slot);
        let mut live: SmallVec<[u8; WIDTH]> = SmallVec::new();
        for (e, slot) in &all[..mid] {
            let slot = match slot {
                Some(slot) => *slot,
                None => match spare.next() {
                    Some(free) => {
                        node.write_entry(free, *e);
                        free
                    }
                    None => unreachable!("leaf split moved no slot to the right"),
                },
            };
            live.push(slot as u8);
        }
        node.set_permutation(Permuter::from_live(&live));
        self.stats.inc_leaf_splits();
        trace!(left = leaf, right, separator, kept = mid, moved, "leaf split");
        self.insert_into_parent(leaf, guard, right, right_guard, separator);
    }

    /// Locks `child`'s parent, retrying if a concurrent internode split
    /// moves `child` while we wait.
    fn locked_parent(&self, child: NodeId) -> (NodeId, NodeLock<'_>) {
        let child_node = self.node(child);
        loop {
            let parent = child_node.parent();
            let guard = self.node(parent).version.lock();
            if child_node.parent() == parent {
                return (parent, guard);
            }
        }
    }

    fn insert_into_parent<'a>(
        &'a self,
        mut left: NodeId,
        mut left_guard: NodeLock<'a>,
        mut right: NodeId,
        mut right_guard: NodeLock<'a>,
        mut separator: u64,
    ) {
        loop {
            let left_node = self.node(left);
            if left_guard.stamp().is_root() {
                let root = self.arena.alloc(false, true);
                let root_node = self.node(root);
                root_node.fill_internode(&[separator], &[left, right]);
                root_node.set_parent(left_node.parent());
                self.node(right).set_parent(root);
                left_node.set_parent(root);
                left_guard.set_root(false);
                self.stats.inc_root_splits();
                trace!(root, left, right, separator, "layer grew a level");
                return;
            }
            let (parent, mut parent_guard) = self.locked_parent(left);
            let parent_node = self.node(parent);
            self.node(right).set_parent(parent);
            if parent_node.key_count() < WIDTH {
                parent_guard.mark_insert();
                parent_node.internode_insert(separator, right);
                drop(right_guard);
                drop(left_guard);
                return;
            }
            parent_guard.mark_split();
            let (sibling, sibling_guard, promoted) = self.split_internode(parent, separator, right);
            drop(right_guard);
            drop(left_guard);
            left = parent;
            left_guard = parent_guard;
            right = sibling;
            right_guard = sibling_guard;
            separator = promoted;
        }
    }

    fn split_internode(&self, id: NodeId, separator: u64, right: NodeId) -> (NodeId, NodeLock<'_>, u64) {
        let node = self.node(id);
        let (mut separators, mut children) = node.internode_contents();
        let index = separators.iter().take_while(|&&s| s <= separator).count();
        separators.insert(index, separator);
        children.insert(index + 1, right);
        let half = separators.len() / 2;
        let promoted = separators[half];

        let sibling = self.arena.alloc(false, false);
        let sibling_node = self.node(sibling);
        let sibling_guard = sibling_node.version.lock();
        sibling_node.fill_internode(&separators[half + 1..], &children[half + 1..]);
        sibling_node.set_parent(node.parent());
        for &child in &children[half + 1..] {
            self.node(child).set_parent(sibling);
        }
        node.fill_internode(&separators[..half], &children[..=half]);
        self.stats.inc_internode_splits();
        trace!(left = id, right = sibling, promoted, "internode split");
        (sibling, sibling_guard, promoted)
    }

    /// Unlinks the empty single-leaf layer at the bottom of `starts`, then
    /// keeps going upward while that leaves the parent layer empty too.
    ///
    /// `starts[d]` is the node layer `d` of `key` starts at. Layer 0 is never
    /// collected.
    pub(crate) fn collect_layers(&self, ctx: &ThreadContext, key: &[u8], starts: &[NodeId]) {
        let mut depth = starts.len().saturating_sub(1);
        while depth > 0 {
            let child = starts[depth];
            let parent_start = starts[depth - 1];
            let (ikey, class) = slice_of(&key[(depth - 1) * SLICE_LEN..]);
            debug_assert_eq!(class, LAYER);
            let Some((leaf, mut parent_guard)) = self.locked_leaf(parent_start, ikey) else {
                return;
            };
            let parent_node = self.node(leaf);
            let perm = parent_node.permutation();
            let (pos, found) = parent_node.lower_bound(perm, ikey, LAYER);
            if !found || parent_node.value(perm.get(pos)) != child as usize {
                return;
            }
            let child_node = self.node(child);
            let mut child_guard = child_node.version.lock();
            let stamp = child_guard.stamp();
            if stamp.is_deleted()
                || !stamp.is_root()
                || !stamp.is_leaf()
                || child_node.permutation().size() != 0
            {
                return;
            }
            child_guard.mark_deleted();
            parent_guard.mark_insert();
            let remaining = perm.remove(pos);
            parent_node.set_permutation(remaining);
            drop(child_guard);
            let cascade = depth > 1
                && remaining.size() == 0
                && leaf == parent_start
                && parent_guard.stamp().is_root();
            drop(parent_guard);

            self.stats.inc_layers_collected();
            trace!(node = child, depth, "collected empty layer");
            let arena = Arc::clone(&self.arena);
            let stats = Arc::clone(&self.stats);
            ctx.defer(move || {
                arena.release(child);
                stats.inc_nodes_reclaimed();
            });
            if !cascade {
                return;
            }
            depth -= 1;
        }
    }
}

/// Number of entries the left leaf keeps when `ikeys` (one more than fit)
/// is split. Equal slices never straddle two leaves; appending past the end
/// moves only the new entry.
fn split_point(ikeys: &[u64], inserted: usize) -> usize {
    let len = ikeys.len();
    let boundary = |mid: usize| ikeys[mid - 1] != ikeys[mid];
    if inserted == len - 1 && boundary(len - 1) {
        return len - 1;
    }
    let half = len / 2;
    let down = (1..=half).rev().find(|&m| boundary(m));
    let up = (half + 1..len).find(|&m| boundary(m));
    match (down, up) {
        (Some(d), Some(u)) if u - half < half - d => u,
        (Some(d), _) => d,
        (None, Some(u)) => u,
        (None, None) => half,
    }
}
