//! The index itself.

/// Layered tree engine and the operations built on it.
pub mod trie;

mod options;
mod table;

pub use options::TableOptions;
pub use table::Table;
