use super::trie::MAX_NODES;
use crate::primitives::thread::DEFAULT_RECLAIM_BATCH;
use crate::types::{Result, TrieError};

/// Configuration options supplied when creating a [`super::Table`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableOptions {
    /// Nodes to allocate up front so early splits do not grow the arena
    pub reserve_nodes: usize,
    /// Deferred reclamations a thread buffers before advancing the epoch
    pub reclaim_batch: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            reserve_nodes: 64,
            reclaim_batch: DEFAULT_RECLAIM_BATCH,
        }
    }
}

impl TableOptions {
    /// Options for bulk-loading benchmarks: a large arena up front and rare
    /// epoch advances.
    pub fn benchmark() -> Self {
        Self {
            reserve_nodes: 1 << 16,
            reclaim_batch: 1024,
        }
    }

    /// Options for small tables that churn layers: reclaim eagerly.
    pub fn compact() -> Self {
        Self {
            reserve_nodes: 0,
            reclaim_batch: 8,
        }
    }

    /// Sets the number of nodes allocated up front.
    pub fn reserve_nodes(mut self, nodes: usize) -> Self {
        self.reserve_nodes = nodes;
        self
    }

    /// Sets the reclamation batch size.
    pub fn reclaim_batch(mut self, batch: usize) -> Self {
        self.reclaim_batch = batch;
        self
    }

    /// Rejects settings the table cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.reclaim_batch == 0 {
            return Err(TrieError::Invalid("reclaim_batch must be positive"));
        }
        if self.reserve_nodes > MAX_NODES {
            return Err(TrieError::Invalid("reserve_nodes exceeds the node arena"));
        }
        Ok(())
    }
}
