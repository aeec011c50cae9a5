//! In-memory tree nodes: leaves hold real entries, interior nodes hold
//! separator keys mapped to child locations plus a cache of loaded children.

use std::cmp::Ordering;
use std::ops::{Bound, Deref};

use super::block_map::SortedBlockMap;
use super::entry::{compare_keys, Entry, EntryRef, Value, ValueRef};
use super::options::TreeConfig;
use super::stats::TreeMetrics;
use super::visit::{NodeInfo, TreeVisitor, Visit};
use crate::primitives::block::{BlockStore, Location, NodeKind, LOCATION_LEN};
use crate::types::{Result, TesseraError};

mod interior;
mod leaf;

pub(crate) use interior::InteriorNode;
pub(crate) use leaf::LeafNode;

/// Type tag of interior entry values (`'L'` for location).
pub(crate) const LOCATION_TAG: u8 = 0x4C;

/// Marshalled length of an interior entry value.
pub(crate) const SEPARATOR_VALUE_LEN: usize = 1 + LOCATION_LEN;

/// Key of the lowest entry of every interior node.
pub(crate) const SENTINEL: &[u8] = &[];

/// Read-side collaborators.
#[derive(Clone, Copy)]
pub(crate) struct TreeIo<'a> {
    pub(crate) store: &'a dyn BlockStore,
    pub(crate) metrics: &'a dyn TreeMetrics,
}

/// Everything a mutating descent needs besides the nodes themselves.
pub(crate) struct WriteCtx<'a> {
    pub(crate) io: TreeIo<'a>,
    pub(crate) config: &'a TreeConfig,
    /// Durable blocks to release once the next commit has written its blocks.
    pub(crate) freed: &'a mut Vec<Location>,
}

impl WriteCtx<'_> {
    pub(crate) fn release(&mut self, location: Option<Location>) {
        if let Some(location) = location {
            self.freed.push(location);
        }
    }
}

/// Metadata shared by both node variants.
#[derive(Clone, Debug)]
pub(crate) struct NodeMeta {
    pub(crate) location: Option<Location>,
    pub(crate) dirty: bool,
    pub(crate) level: u16,
}

impl NodeMeta {
    pub(crate) fn fresh(level: u16) -> Self {
        Self {
            location: None,
            dirty: true,
            level,
        }
    }

    pub(crate) fn persisted(location: Location, level: u16) -> Self {
        Self {
            location: Some(location),
            dirty: false,
            level,
        }
    }
}

/// A tree node.
#[derive(Debug)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Interior(InteriorNode),
}

impl Node {
    pub(crate) fn empty_leaf(config: &TreeConfig) -> Result<Node> {
        Ok(Node::Leaf(LeafNode::empty(config)?))
    }

    /// Materializes the node stored at `location`, which the dereferencing
    /// parent expects to sit at `level`.
    pub(crate) fn load(io: TreeIo<'_>, location: Location, level: u16) -> Result<Node> {
        let expected = kind_for_level(level);
        if location.kind != expected {
            tracing::error!(
                target: "tessera::btree",
                address = location.address,
                ?expected,
                found = ?location.kind,
                "child location has the wrong node kind"
            );
            return Err(TesseraError::NodeKindMismatch {
                expected,
                found: location.kind,
            });
        }
        let map = read_map(io, &location)?;
        Ok(Node::from_map(location, level, map))
    }

    /// Loads a root whose level is not recorded anywhere: the height is the
    /// length of the leftmost spine. The root block itself is read once.
    pub(crate) fn load_root(io: TreeIo<'_>, location: Location) -> Result<Node> {
        let map = read_map(io, &location)?;
        let mut level = 0u16;
        if location.kind == NodeKind::Interior {
            level = 1;
            let mut cursor = first_child(&map)?;
            while cursor.kind == NodeKind::Interior {
                let child = SortedBlockMap::wrap(io.store.read_block(&cursor)?)?;
                cursor = first_child(&child)?;
                level = level
                    .checked_add(1)
                    .ok_or(TesseraError::Corruption("tree deeper than u16 levels"))?;
            }
        }
        Ok(Node::from_map(location, level, map))
    }

    fn from_map(location: Location, level: u16, map: SortedBlockMap) -> Node {
        let meta = NodeMeta::persisted(location, level);
        match kind_for_level(level) {
            NodeKind::Leaf => Node::Leaf(LeafNode::from_parts(meta, map)),
            NodeKind::Interior => Node::Interior(InteriorNode::from_parts(meta, map)),
        }
    }

    pub(crate) fn meta(&self) -> &NodeMeta {
        match self {
            Node::Leaf(leaf) => &leaf.meta,
            Node::Interior(inner) => &inner.meta,
        }
    }

    pub(crate) fn meta_mut(&mut self) -> &mut NodeMeta {
        match self {
            Node::Leaf(leaf) => &mut leaf.meta,
            Node::Interior(inner) => &mut inner.meta,
        }
    }

    pub(crate) fn map(&self) -> &SortedBlockMap {
        match self {
            Node::Leaf(leaf) => &leaf.map,
            Node::Interior(inner) => &inner.map,
        }
    }

    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            Node::Leaf(_) => NodeKind::Leaf,
            Node::Interior(_) => NodeKind::Interior,
        }
    }

    pub(crate) fn level(&self) -> u16 {
        self.meta().level
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.meta().dirty
    }

    pub(crate) fn location(&self) -> Option<Location> {
        self.meta().location
    }

    pub(crate) fn info(&self) -> NodeInfo<'_> {
        let meta = self.meta();
        NodeInfo {
            kind: self.kind(),
            level: meta.level,
            location: meta.location,
            dirty: meta.dirty,
            map: self.map(),
        }
    }

    pub(crate) fn get(&self, io: TreeIo<'_>, key: &[u8]) -> Result<Option<Value>> {
        match self {
            Node::Leaf(leaf) => Ok(leaf.map.get(key)?.map(|e| e.value.to_value())),
            Node::Interior(inner) => inner.get(io, key),
        }
    }

    pub(crate) fn first(&self, io: TreeIo<'_>) -> Result<Option<Entry>> {
        match self {
            Node::Leaf(leaf) => Ok(leaf.map.first()?.map(|e| e.to_entry())),
            Node::Interior(inner) => inner.first(io),
        }
    }

    pub(crate) fn last(&self, io: TreeIo<'_>) -> Result<Option<Entry>> {
        match self {
            Node::Leaf(leaf) => Ok(leaf.map.last()?.map(|e| e.to_entry())),
            Node::Interior(inner) => inner.last(io),
        }
    }

    /// Depth-first traversal; returns [`Visit::Stop`] once any hook asks to stop.
    pub(crate) fn visit(&self, io: TreeIo<'_>, visitor: &mut dyn TreeVisitor) -> Result<Visit> {
        match self {
            Node::Leaf(_) => visitor.leaf(&self.info()),
            Node::Interior(inner) => {
                if visitor.before_interior(&self.info())? == Visit::Stop {
                    return Ok(Visit::Stop);
                }
                for idx in 0..inner.map.len() {
                    let child = inner.child_for_read(io, idx)?;
                    if child.visit(io, visitor)? == Visit::Stop {
                        return Ok(Visit::Stop);
                    }
                }
                visitor.after_interior(&self.info())
            }
        }
    }

    pub(crate) fn scan(
        &self,
        io: TreeIo<'_>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        f: &mut dyn FnMut(EntryRef<'_>) -> Visit,
    ) -> Result<Visit> {
        match self {
            Node::Leaf(leaf) => leaf.scan(lower, upper, f),
            Node::Interior(inner) => inner.scan(io, lower, upper, f),
        }
    }

    /// Validates this subtree; every key must satisfy `lower <= key < upper`.
    pub(crate) fn check(
        &self,
        io: TreeIo<'_>,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> Result<Option<String>> {
        let meta = self.meta();
        if let Some(report) = self.map().integrity_check() {
            return Ok(Some(format!(
                "{} node at level {} ({:?}): {report}",
                self.kind(),
                meta.level,
                meta.location.map(|l| l.address)
            )));
        }
        match self {
            Node::Leaf(leaf) => leaf.check_bounds(lower, upper),
            Node::Interior(inner) => inner.check(io, lower, upper),
        }
    }

    pub(crate) fn commit(&mut self, ctx: &mut WriteCtx<'_>) -> Result<bool> {
        match self {
            Node::Leaf(leaf) => leaf.commit(ctx),
            Node::Interior(inner) => inner.commit(ctx),
        }
    }

    /// Clears dirty flags and drops every cached child below this node.
    pub(crate) fn finish_commit(&mut self) {
        match self {
            Node::Leaf(leaf) => leaf.meta.dirty = false,
            Node::Interior(inner) => inner.finish_commit(),
        }
    }
}

/// Child handle for read-only descents: either borrowed from the parent's
/// cache or loaded just for this traversal.
pub(crate) enum ChildRef<'a> {
    Cached(&'a Node),
    Loaded(Box<Node>),
}

impl Deref for ChildRef<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            ChildRef::Cached(node) => node,
            ChildRef::Loaded(node) => node,
        }
    }
}

/// True when `key` lies beyond the upper end of a scan range.
pub(crate) fn past_upper(key: &[u8], upper: Bound<&[u8]>) -> bool {
    match upper {
        Bound::Unbounded => false,
        Bound::Included(limit) => compare_keys(key, limit) == Ordering::Greater,
        Bound::Excluded(limit) => compare_keys(key, limit) != Ordering::Less,
    }
}

fn read_map(io: TreeIo<'_>, location: &Location) -> Result<SortedBlockMap> {
    let map = SortedBlockMap::wrap(io.store.read_block(location)?)?;
    io.metrics.node_loaded(location.kind);
    tracing::trace!(
        target: "tessera::btree",
        address = location.address,
        entries = map.len(),
        "loaded node"
    );
    Ok(map)
}

fn first_child(map: &SortedBlockMap) -> Result<Location> {
    let first = map
        .first()?
        .ok_or(TesseraError::Corruption("interior node without entries"))?;
    decode_location(first.value)?
        .ok_or(TesseraError::Corruption("persisted child location unassigned"))
}

pub(crate) fn kind_for_level(level: u16) -> NodeKind {
    if level == 0 {
        NodeKind::Leaf
    } else {
        NodeKind::Interior
    }
}

pub(crate) fn encode_location(location: Option<&Location>) -> [u8; LOCATION_LEN] {
    let mut buf = [0u8; LOCATION_LEN];
    Location::marshal(location, &mut buf);
    buf
}

pub(crate) fn decode_location(value: ValueRef<'_>) -> Result<Option<Location>> {
    if value.tag != LOCATION_TAG {
        return Err(TesseraError::Corruption("interior entry is not a child location"));
    }
    Location::unmarshal(value.payload)
}
