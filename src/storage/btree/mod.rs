#![forbid(unsafe_code)]

//! Persistent copy-on-write B-tree.
//!
//! Every node's payload is a [`SortedBlockMap`]. Leaves map keys to values;
//! interior nodes map separator keys to child [`Location`]s, their first
//! separator always being the empty sentinel key.
//!
//! [`Location`]: crate::primitives::block::Location

/// Fixed-capacity sorted block format shared by all nodes.
pub mod block_map;
mod entry;
mod node;
mod options;
mod stats;
mod tree;
mod visit;

pub use block_map::{MapCursor, MapPut, Nearest, SortedBlockMap};
pub use entry::{compare_keys, Entry, EntryRef, Value, ValueRef};
pub use options::TreeConfig;
pub use stats::{CounterMetrics, NoopMetrics, TreeMetrics, TreeStatsSnapshot};
pub use tree::BTree;
pub use visit::{NodeInfo, TreeVisitor, Visit};
