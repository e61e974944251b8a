#![forbid(unsafe_code)]

//! Identifiers and the error type shared by every layer of the crate.

use std::fmt;

/// Opaque, caller-owned value handle stored by the index.
///
/// The index stores the handle and hands it back; it never dereferences,
/// copies, or frees whatever the handle refers to.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ValueHandle(pub usize);

impl ValueHandle {
    /// The null handle. Storing it is allowed.
    pub const NULL: ValueHandle = ValueHandle(0);

    /// Wraps a raw pointer to caller-owned storage.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        ValueHandle(ptr as usize)
    }

    /// Returns the handle reinterpreted as a raw pointer.
    ///
    /// Dereferencing the pointer is the caller's business.
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the raw handle bits.
    pub fn get(self) -> usize {
        self.0
    }

    /// Whether this is [`ValueHandle::NULL`].
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for ValueHandle {
    fn from(value: usize) -> Self {
        ValueHandle(value)
    }
}

impl From<ValueHandle> for usize {
    fn from(value: ValueHandle) -> Self {
        value.0
    }
}

/// Opaque identity of a tree node, reported to scan callbacks.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeRef(pub(crate) u32);

impl NodeRef {
    /// Returns the raw node number. Numbers are recycled once a node is reclaimed.
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Errors surfaced by table and registry construction.
///
/// Missing and duplicate keys are reported through `bool`/`Option` returns,
/// never through this type.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TrieError {
    /// A configuration value was rejected.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrieError>;
