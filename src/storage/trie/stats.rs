use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Point-in-time copy of [`TrieStats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieStatsSnapshot {
    /// Leaf splits performed
    pub leaf_splits: u64,
    /// Internode splits performed
    pub internode_splits: u64,
    /// Splits that grew a layer by one level
    pub root_splits: u64,
    /// Layers created for keys sharing an 8-byte slice
    pub layers_created: u64,
    /// Empty layers unlinked from their parent layer
    pub layers_collected: u64,
    /// Point lookups that had to re-read a node
    pub lookup_retries: u64,
    /// Scan steps that had to re-read a leaf
    pub scan_retries: u64,
    /// Cursor searches restarted after racing a split or delete
    pub cursor_restarts: u64,
    /// Nodes returned to the arena after their grace period
    pub nodes_reclaimed: u64,
}

/// Live counters shared by every operation on one table.
#[derive(Default, Debug)]
pub struct TrieStats {
    leaf_splits: AtomicU64,
    internode_splits: AtomicU64,
    root_splits: AtomicU64,
    layers_created: AtomicU64,
    layers_collected: AtomicU64,
    lookup_retries: AtomicU64,
    scan_retries: AtomicU64,
    cursor_restarts: AtomicU64,
    nodes_reclaimed: AtomicU64,
}

impl TrieStats {
    /// Returns the number of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of internode splits.
    pub fn internode_splits(&self) -> u64 {
        self.internode_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root splits.
    pub fn root_splits(&self) -> u64 {
        self.root_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of layers created.
    pub fn layers_created(&self) -> u64 {
        self.layers_created.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of layers collected.
    pub fn layers_collected(&self) -> u64 {
        self.layers_collected.load(AtomicOrdering::Relaxed)
    }

    /// Returns how often a lookup re-read a node.
    pub fn lookup_retries(&self) -> u64 {
        self.lookup_retries.load(AtomicOrdering::Relaxed)
    }

    /// Returns how often a scan re-read a leaf.
    pub fn scan_retries(&self) -> u64 {
        self.scan_retries.load(AtomicOrdering::Relaxed)
    }

    /// Returns how often a cursor restarted its search.
    pub fn cursor_restarts(&self) -> u64 {
        self.cursor_restarts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of nodes recycled.
    pub fn nodes_reclaimed(&self) -> u64 {
        self.nodes_reclaimed.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internode_splits(&self) {
        self.internode_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_layers_created(&self) {
        self.layers_created.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_layers_collected(&self) {
        self.layers_collected.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_lookup_retries(&self) {
        self.lookup_retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_scan_retries(&self) {
        self.scan_retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cursor_restarts(&self) {
        self.cursor_restarts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_nodes_reclaimed(&self) {
        self.nodes_reclaimed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current counters.
    pub fn snapshot(&self) -> TrieStatsSnapshot {
        TrieStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            internode_splits: self.internode_splits(),
            root_splits: self.root_splits(),
            layers_created: self.layers_created(),
            layers_collected: self.layers_collected(),
            lookup_retries: self.lookup_retries(),
            scan_retries: self.scan_retries(),
            cursor_restarts: self.cursor_restarts(),
            nodes_reclaimed: self.nodes_reclaimed(),
        }
    }

    /// Emits the current counters as one tracing event.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "triekv::stats",
            leaf_splits = snapshot.leaf_splits,
            internode_splits = snapshot.internode_splits,
            root_splits = snapshot.root_splits,
            layers_created = snapshot.layers_created,
            layers_collected = snapshot.layers_collected,
            lookup_retries = snapshot.lookup_retries,
            scan_retries = snapshot.scan_retries,
            cursor_restarts = snapshot.cursor_restarts,
            nodes_reclaimed = snapshot.nodes_reclaimed,
            "trie stats snapshot"
        );
    }
}
