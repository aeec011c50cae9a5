#![forbid(unsafe_code)]
//! Shared error type and small value types used across the engine.

use std::fmt;

use crate::primitives::block::NodeKind;

/// Checksums used to frame persisted blocks.
pub mod checksum;

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum TesseraError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Structural corruption with a fixed diagnostic.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Structural corruption with a computed diagnostic.
    #[error("corruption: {0}")]
    CorruptionAt(String),
    /// A caller-supplied argument or configuration is malformed.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// An entry exceeds the configured per-entry ceiling.
    #[error("entry of {len} bytes exceeds the {max} byte ceiling")]
    EntryTooLarge {
        /// Marshalled key plus value length.
        len: usize,
        /// Configured ceiling.
        max: usize,
    },
    /// A location's node-kind tag does not match the dereferencing context.
    #[error("node kind mismatch: expected {expected}, found {found}")]
    NodeKindMismatch {
        /// Kind required by the parent.
        expected: NodeKind,
        /// Kind recorded on the location.
        found: NodeKind,
    },
    /// The structure changed underneath an iterator or a commit.
    #[error("concurrent modification detected")]
    ConcurrentModification,
    /// The tree was closed.
    #[error("tree is closed")]
    Closed,
    /// No block is stored at the given address.
    #[error("no block at address {0}")]
    BlockNotFound(u64),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Leaf => f.write_str("leaf"),
            NodeKind::Interior => f.write_str("interior"),
        }
    }
}
