use super::block_map::SortedBlockMap;
use crate::primitives::block::{Location, NodeKind};
use crate::types::Result;

/// Whether a traversal should keep going.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visit {
    /// Proceed to the next node or entry.
    Continue,
    /// Abandon the traversal; the walk unwinds back to its caller.
    Stop,
}

/// Read-only view of a node handed to [`TreeVisitor`] hooks.
#[derive(Clone, Copy, Debug)]
pub struct NodeInfo<'a> {
    /// Node variant.
    pub kind: NodeKind,
    /// Distance from the leaves; leaves are level 0.
    pub level: u16,
    /// Persisted location, if the node has been written.
    pub location: Option<Location>,
    /// Whether the node differs from its persisted block.
    pub dirty: bool,
    /// Entries of the node; separators map to child locations on interior nodes.
    pub map: &'a SortedBlockMap,
}

/// Depth-first tree walker.
///
/// Interior nodes are reported before and after their children; leaves are
/// reported once. Returning [`Visit::Stop`] from any hook ends the walk.
pub trait TreeVisitor {
    /// Called before descending into an interior node's children.
    fn before_interior(&mut self, _node: &NodeInfo<'_>) -> Result<Visit> {
        Ok(Visit::Continue)
    }

    /// Called after every child of an interior node has been visited.
    fn after_interior(&mut self, _node: &NodeInfo<'_>) -> Result<Visit> {
        Ok(Visit::Continue)
    }

    /// Called for each leaf.
    fn leaf(&mut self, node: &NodeInfo<'_>) -> Result<Visit>;
}

/// Sums leaf entry counts.
#[derive(Default)]
pub(crate) struct EntryCounter {
    pub(crate) entries: u64,
}

impl TreeVisitor for EntryCounter {
    fn leaf(&mut self, node: &NodeInfo<'_>) -> Result<Visit> {
        self.entries += node.map.len() as u64;
        Ok(Visit::Continue)
    }
}
