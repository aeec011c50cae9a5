//! Low-level primitives for building the storage engine.
//!
//! Includes the block-store abstraction consumed by the tree and the
//! positioned file I/O it is implemented on.

/// Block stores and the location handles they hand out.
///
/// Nodes are persisted copy-on-write as whole blocks addressed by [`block::Location`].
pub mod block;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;
