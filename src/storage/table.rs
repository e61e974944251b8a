//! Table handle: the operation surface of one index instance.

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use super::options::TableOptions;
use super::trie::{Cursor, Finish, ScanVisitor, Trie, TrieStats, TrieStatsSnapshot};
use crate::primitives::thread::{ThreadHandle, ThreadRegistry};
use crate::types::{Result, ValueHandle};

/// A concurrent ordered index from byte keys to [`ValueHandle`]s.
///
/// Share it across threads by reference (or `Arc`). Every operation takes
/// the calling thread's [`ThreadHandle`], obtained once per thread through
/// [`Table::register`].
pub struct Table {
    trie: Trie,
    registry: Arc<ThreadRegistry>,
    options: TableOptions,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    /// Creates a table with default options and its own thread registry.
    /// The calling thread becomes the main context.
    pub fn new() -> Self {
        Self::build(Arc::new(ThreadRegistry::new()), TableOptions::default())
    }

    /// Creates a table with its own thread registry.
    pub fn with_options(options: TableOptions) -> Result<Self> {
        options.validate()?;
        let registry = ThreadRegistry::with_reclaim_batch(options.reclaim_batch)?;
        Ok(Self::build(Arc::new(registry), options))
    }

    /// Creates a table whose threads and epochs are managed by `registry`,
    /// which may be shared with other tables. The registry's own batch size
    /// governs reclamation.
    pub fn with_registry(registry: Arc<ThreadRegistry>, options: TableOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(registry, options))
    }

    fn build(registry: Arc<ThreadRegistry>, options: TableOptions) -> Self {
        let main = registry.main_context();
        let trie = Trie::new(options.reserve_nodes, Arc::new(TrieStats::default()));
        debug!(
            root = trie.root,
            reserve_nodes = options.reserve_nodes,
            main_thread = main.thread_id(),
            "table initialized"
        );
        Self {
            trie,
            registry,
            options,
        }
    }

    /// Registers the calling thread. Idempotent per thread.
    pub fn register(&self, thread_id: usize) -> ThreadHandle {
        self.registry.register(thread_id)
    }

    /// Context of the calling thread, created as the main context if the
    /// thread has none yet.
    pub fn main_context(&self) -> ThreadHandle {
        self.registry.main_context()
    }

    /// Context of the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread never registered.
    pub fn current_thread(&self) -> ThreadHandle {
        self.registry.expect_current()
    }

    /// Registry backing this table.
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// Options the table was created with.
    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    /// Starts a mutation cycle on `key`. See [`Cursor`].
    pub fn cursor<'t>(&'t self, thread: &'t ThreadHandle, key: &'t [u8]) -> Cursor<'t> {
        self.registry.check(thread);
        Cursor::new(&self.trie, thread, key)
    }

    /// Inserts `key` unless it is present. Never overwrites.
    ///
    /// Returns `true` if the entry was inserted.
    pub fn insert(&self, thread: &ThreadHandle, key: &[u8], value: ValueHandle) -> bool {
        let mut cursor = self.cursor(thread, key);
        if cursor.find_insert() {
            cursor.finish(Finish::Release);
            return false;
        }
        cursor.set_value(value);
        cursor.finish(Finish::CommitInsert);
        true
    }

    /// Replaces the value of an existing `key`. Never creates an entry.
    ///
    /// Returns `true` if the key was present.
    pub fn update(&self, thread: &ThreadHandle, key: &[u8], value: ValueHandle) -> bool {
        let mut cursor = self.cursor(thread, key);
        let found = cursor.find_locked();
        if found {
            cursor.set_value(value);
        }
        cursor.finish(Finish::Release);
        found
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn remove(&self, thread: &ThreadHandle, key: &[u8]) -> bool {
        let mut cursor = self.cursor(thread, key);
        if cursor.find_locked() {
            cursor.finish(Finish::CommitRemove);
            return true;
        }
        cursor.finish(Finish::Release);
        false
    }

    /// Value stored under `key`, read without locking.
    pub fn get(&self, thread: &ThreadHandle, key: &[u8]) -> Option<ValueHandle> {
        self.registry.check(thread);
        let _pin = thread.context().pin();
        self.trie.get(key)
    }

    /// Visits the entries between `lower` and `upper` in ascending order.
    ///
    /// Stops when an entry falls past `upper`, when the visitor returns
    /// `false`, or after `limit` entries. Returns how many entries were
    /// delivered.
    pub fn scan<V: ScanVisitor + ?Sized>(
        &self,
        thread: &ThreadHandle,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        visitor: &mut V,
        limit: Option<usize>,
    ) -> usize {
        self.registry.check(thread);
        let _pin = thread.context().pin();
        self.trie.scan(lower, upper, visitor, limit)
    }

    /// Visits the entries between `lower` and `upper` in descending order,
    /// starting from `upper` and stopping once an entry falls past `lower`.
    pub fn rscan<V: ScanVisitor + ?Sized>(
        &self,
        thread: &ThreadHandle,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        visitor: &mut V,
        limit: Option<usize>,
    ) -> usize {
        self.registry.check(thread);
        let _pin = thread.context().pin();
        self.trie.rscan(lower, upper, visitor, limit)
    }

    /// Advances the epoch and runs the calling thread's reclamations that
    /// became safe. Returns how many ran.
    pub fn quiesce(&self, thread: &ThreadHandle) -> usize {
        self.registry.check(thread);
        thread.context().collect()
    }

    /// Live counters.
    pub fn stats(&self) -> Arc<TrieStats> {
        Arc::clone(&self.trie.stats)
    }

    /// Copy of the live counters.
    pub fn stats_snapshot(&self) -> TrieStatsSnapshot {
        self.trie.stats.snapshot()
    }

    /// Emits the counters as a tracing event.
    pub fn emit_stats(&self) {
        self.trie.stats.emit_tracing();
    }

    /// Nodes allocated so far and nodes waiting for reuse.
    pub fn arena_usage(&self) -> (usize, usize) {
        (self.trie.arena.allocated(), self.trie.arena.free_len())
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("root", &self.trie.root)
            .field("options", &self.options)
            .field("registry", &self.registry)
            .finish()
    }
}
