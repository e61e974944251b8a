//! Optimistic point lookup.

use super::key::{Key, LAYER};
use super::node::NodeId;
use super::tree::{Descend, Trie};
use crate::types::ValueHandle;

impl Trie {
    /// Finds the value stored under `full` without taking any lock.
    ///
    /// Each leaf read is validated against the leaf's version stamp and
    /// redone when a writer overlapped it. The caller must be pinned.
    pub(crate) fn get(&self, full: &[u8]) -> Option<ValueHandle> {
        'restart: loop {
            let mut key = Key::new(full);
            let mut start: NodeId = self.root;
            loop {
                let (ikey, class) = (key.ikey(), key.class());
                let (mut leaf, mut stamp) = match self.reach_leaf(start, ikey) {
                    Descend::Leaf(leaf, stamp) => self.walk_right(leaf, stamp, ikey),
                    Descend::Gone => {
                        self.stats.inc_lookup_retries();
                        continue 'restart;
                    }
                };
                let value = loop {
                    let node = self.node(leaf);
                    let perm = node.permutation();
                    let (pos, found) = node.lower_bound(perm, ikey, class);
                    let value = found.then(|| node.value(perm.get(pos)));
                    if !node.version.has_changed(stamp) {
                        break value;
                    }
                    self.stats.inc_lookup_retries();
                    stamp = node.version.stable();
                    if stamp.is_deleted() {
                        continue 'restart;
                    }
                    (leaf, stamp) = self.walk_right(leaf, stamp, ikey);
                };
                match value {
                    None => return None,
                    Some(link) if class == LAYER => {
                        start = link as NodeId;
                        key.shift();
                    }
                    Some(value) => return Some(ValueHandle(value)),
                }
            }
        }
    }
}
