#![forbid(unsafe_code)]

//! Trie of B-link trees.

mod arena;
mod cursor;
mod key;
mod lookup;
mod node;
mod scan;
mod stats;
mod tree;

pub(crate) use arena::MAX_NODES;
pub use cursor::{Cursor, Finish};
pub use key::KeyCodec;
pub use scan::{key_bound, ScanCallbacks, ScanVisitor};
pub use stats::{TrieStats, TrieStatsSnapshot};
pub(crate) use tree::Trie;
