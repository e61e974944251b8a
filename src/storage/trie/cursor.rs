//! Locked mutation cursor.
//!
//! A [`Cursor`] runs one find → act → finish cycle. The find step locks the
//! leaf that holds (or would hold) the key and keeps it locked; the caller
//! inspects the result, optionally writes a value, and then picks a
//! [`Finish`] disposition. Every path, including an early return or a panic
//! that drops the cursor, releases the lock exactly once.

use std::fmt;
use std::sync::atomic::{fence, Ordering};

use smallvec::SmallVec;

use super::key::{Key, LAYER};
use super::node::{Entry, NodeId};
use super::tree::Trie;
use crate::primitives::concurrency::NodeLock;
use crate::primitives::epoch::EpochGuard;
use crate::primitives::thread::ThreadHandle;
use crate::types::ValueHandle;

/// How a cursor ends its cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Finish {
    /// Release the lock without structural change. Value overwrites made
    /// through [`Cursor::set_value`] on a found entry are already published.
    Release,
    /// Insert the pending value at the position the find step located.
    CommitInsert,
    /// Remove the entry the find step located.
    CommitRemove,
}

struct Held<'t> {
    leaf: NodeId,
    lock: NodeLock<'t>,
    pos: usize,
    slot: Option<usize>,
    ikey: u64,
    class: u8,
}

/// One in-flight mutation against a table.
///
/// Borrowed from the table and the calling thread's handle; it cannot leave
/// the thread or outlive the call that created it. While a find step holds a
/// leaf lock, the same thread must not insert, update or remove through the
/// table: leaf locks are not reentrant and such a call spins forever.
///
/// Dropping a cursor without [`Cursor::finish`] behaves like
/// [`Finish::Release`], including collecting layers an abandoned
/// [`Cursor::find_insert`] created.
pub struct Cursor<'t> {
    trie: &'t Trie,
    thread: &'t ThreadHandle,
    key: &'t [u8],
    held: Option<Held<'t>>,
    starts: SmallVec<[NodeId; 4]>,
    pending: Option<ValueHandle>,
    _pin: EpochGuard<'t>,
}

impl<'t> Cursor<'t> {
    pub(crate) fn new(trie: &'t Trie, thread: &'t ThreadHandle, key: &'t [u8]) -> Self {
        Self {
            trie,
            thread,
            key,
            held: None,
            starts: SmallVec::new(),
            pending: None,
            _pin: thread.context().pin(),
        }
    }

    /// Key this cursor operates on.
    pub fn key(&self) -> &[u8] {
        self.key
    }

    /// Locks the leaf for the key, creating intermediate layers the key
    /// needs. Returns whether the key is present.
    pub fn find_insert(&mut self) -> bool {
        self.find(true)
    }

    /// Locks the leaf for the key without creating anything. Returns whether
    /// the key is present.
    pub fn find_locked(&mut self) -> bool {
        self.find(false)
    }

    fn find(&mut self, create_layers: bool) -> bool {
        self.held = None;
        self.pending = None;
        let trie = self.trie;
        'restart: loop {
            self.starts.clear();
            let mut key = Key::new(self.key);
            let mut start = trie.root;
            loop {
                self.starts.push(start);
                let (ikey, class) = (key.ikey(), key.class());
                let Some((leaf, lock)) = trie.locked_leaf(start, ikey) else {
                    trie.stats.inc_cursor_restarts();
                    continue 'restart;
                };
                let node = trie.node(leaf);
                let perm = node.permutation();
                let (pos, found) = node.lower_bound(perm, ikey, class);
                if class == LAYER {
                    if found {
                        start = node.value(perm.get(pos)) as NodeId;
                        drop(lock);
                        key.shift();
                        continue;
                    }
                    if create_layers {
                        let child = trie.new_layer();
                        let link = Entry {
                            ikey,
                            class: LAYER,
                            value: child as usize,
                        };
                        trie.insert_at(lock, leaf, pos, link);
                        self.starts.pop();
                        continue;
                    }
                }
                let slot = found.then(|| perm.get(pos));
                self.held = Some(Held {
                    leaf,
                    lock,
                    pos,
                    slot,
                    ikey,
                    class,
                });
                return found;
            }
        }
    }

    /// Whether the last find step located the key.
    pub fn is_found(&self) -> bool {
        matches!(&self.held, Some(Held { slot: Some(_), .. }))
    }

    /// Value of the located entry.
    pub fn value(&self) -> Option<ValueHandle> {
        let held = self.held.as_ref()?;
        let slot = held.slot?;
        Some(ValueHandle(self.trie.node(held.leaf).value(slot)))
    }

    /// Overwrites the located entry's value in place and publishes it, or,
    /// when the key is absent, stages `value` for [`Finish::CommitInsert`].
    pub fn set_value(&mut self, value: ValueHandle) {
        match self.held.as_mut() {
            Some(Held {
                leaf,
                lock,
                slot: Some(slot),
                ..
            }) => {
                lock.mark_insert();
                self.trie.node(*leaf).set_value(*slot, value.get());
                fence(Ordering::Release);
            }
            _ => self.pending = Some(value),
        }
    }

    /// Ends the cycle with `how` and releases the lock.
    ///
    /// A disposition that does not apply (inserting over a present key,
    /// removing an absent one) only releases.
    pub fn finish(mut self, how: Finish) {
        let Some(mut held) = self.held.take() else {
            return;
        };
        if how == Finish::CommitInsert && held.class == LAYER && self.pending.is_some() {
            // find_locked stopped above the layers this key needs
            let pending = self.pending.take();
            drop(held);
            self.find(true);
            self.pending = pending;
            held = match self.held.take() {
                Some(held) => held,
                None => return,
            };
        }
        let node = self.trie.node(held.leaf);
        match (how, held.slot) {
            (Finish::CommitInsert, None) => match self.pending.take() {
                Some(value) => {
                    let entry = Entry {
                        ikey: held.ikey,
                        class: held.class,
                        value: value.get(),
                    };
                    self.trie.insert_at(held.lock, held.leaf, held.pos, entry);
                }
                None => self.release(held),
            },
            (Finish::CommitRemove, Some(_)) => {
                let Held { leaf, mut lock, pos, .. } = held;
                lock.mark_insert();
                let remaining = node.permutation().remove(pos);
                node.set_permutation(remaining);
                let emptied = self.layer_emptied(leaf, &lock);
                drop(lock);
                if emptied {
                    self.trie.collect_layers(self.thread.context(), self.key, &self.starts);
                }
            }
            _ => self.release(held),
        }
    }

    fn release(&self, held: Held<'t>) {
        let emptied = self.layer_emptied(held.leaf, &held.lock);
        drop(held);
        if emptied {
            self.trie.collect_layers(self.thread.context(), self.key, &self.starts);
        }
    }

    /// Whether the locked leaf is the sole, empty leaf of a layer below the
    /// first one.
    fn layer_emptied(&self, leaf: NodeId, lock: &NodeLock<'_>) -> bool {
        let stamp = lock.stamp();
        self.starts.len() > 1
            && self.starts.last() == Some(&leaf)
            && stamp.is_root()
            && stamp.is_leaf()
            && self.trie.node(leaf).permutation().size() == 0
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            self.release(held);
        }
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("key", &self.key)
            .field("locked", &self.held.is_some())
            .field("found", &self.is_found())
            .field("layer", &(self.starts.len().saturating_sub(1)))
            .finish()
    }
}
