//! Low-level primitives the index is built on.
//!
//! Includes the per-node version lock, the reclamation epoch coordinator,
//! and the per-thread contexts that tie the two together.

/// Concurrency primitives and synchronization.
///
/// Version-stamped node locks and spin backoff.
pub mod concurrency;

/// Epoch-based reclamation.
pub mod epoch;

/// Per-thread contexts and their registry.
pub mod thread;
