//! Storage engine built on the block primitives.
//!
//! The only structure is the persistent B-tree; callers layer collections,
//! catalogs and document encoding on top of it.

/// Persistent copy-on-write B-tree.
pub mod btree;

pub use btree::{BTree, TreeConfig, Value};
