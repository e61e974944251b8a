//! Concurrent ordered in-memory index over byte keys.
//!
//! The index is a trie of B-link trees: each layer orders eight bytes of the
//! key and hands longer keys down to the next layer. Writers lock single
//! leaves, readers validate version stamps instead of locking, and nodes
//! unlinked under concurrent readers are recycled through reclamation epochs.
//!
//! ```
//! use std::ops::Bound;
//! use triekv::{ScanCallbacks, Table, ValueHandle};
//!
//! let table = Table::new();
//! let me = table.register(0);
//! assert!(table.insert(&me, b"10", ValueHandle(10)));
//! assert!(table.insert(&me, b"20", ValueHandle(20)));
//! assert!(!table.insert(&me, b"20", ValueHandle(99)));
//! assert_eq!(table.get(&me, b"20"), Some(ValueHandle(20)));
//!
//! let mut keys = Vec::new();
//! let mut visitor = ScanCallbacks::entries(|key: &[u8], _| {
//!     keys.push(key.to_vec());
//!     true
//! });
//! table.scan(&me, Bound::Unbounded, Bound::Unbounded, &mut visitor, None);
//! assert_eq!(keys, vec![b"10".to_vec(), b"20".to_vec()]);
//! ```

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::thread::{ThreadHandle, ThreadRegistry, ThreadRole};
pub use storage::trie::{
    key_bound, Cursor, Finish, KeyCodec, ScanCallbacks, ScanVisitor, TrieStats, TrieStatsSnapshot,
};
pub use storage::{Table, TableOptions};
pub use types::{NodeRef, Result, TrieError, ValueHandle};
