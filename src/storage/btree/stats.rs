use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::primitives::block::NodeKind;

/// Sink for structural events raised by the tree.
///
/// The sink is injected when the tree is opened and threaded through every
/// operation; there is no process-wide counter state.
pub trait TreeMetrics: Send + Sync {
    /// A non-root node was split into two siblings.
    fn node_split(&self, kind: NodeKind);
    /// Two sibling nodes were merged.
    fn node_merged(&self, kind: NodeKind);
    /// A leaf root was split under a new level-1 root.
    fn upgraded(&self);
    /// An interior root was split under a new, taller root.
    fn grew(&self);
    /// An interior root above level 1 was replaced by its only child.
    fn shrank(&self);
    /// A level-1 root was replaced by its only leaf child.
    fn downgraded(&self);
    /// A node was read from the block store.
    fn node_loaded(&self, kind: NodeKind);
    /// A node was written to the block store.
    fn node_written(&self, kind: NodeKind);
    /// A durable block was released.
    fn block_freed(&self);
    /// A commit wrote a new root.
    fn committed(&self);
}

/// Metrics sink that discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl TreeMetrics for NoopMetrics {
    fn node_split(&self, _kind: NodeKind) {}
    fn node_merged(&self, _kind: NodeKind) {}
    fn upgraded(&self) {}
    fn grew(&self) {}
    fn shrank(&self) {}
    fn downgraded(&self) {}
    fn node_loaded(&self, _kind: NodeKind) {}
    fn node_written(&self, _kind: NodeKind) {}
    fn block_freed(&self) {}
    fn committed(&self) {}
}

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStatsSnapshot {
    /// Number of leaf splits below the root
    pub leaf_splits: u64,
    /// Number of interior splits below the root
    pub interior_splits: u64,
    /// Number of leaf merges
    pub leaf_merges: u64,
    /// Number of interior merges
    pub interior_merges: u64,
    /// Number of leaf-root upgrades
    pub upgrades: u64,
    /// Number of interior-root grows
    pub grows: u64,
    /// Number of interior-root shrinks
    pub shrinks: u64,
    /// Number of level-1 root downgrades
    pub downgrades: u64,
    /// Number of leaves read from the store
    pub leaf_loads: u64,
    /// Number of interior nodes read from the store
    pub interior_loads: u64,
    /// Number of leaves written
    pub leaf_writes: u64,
    /// Number of interior nodes written
    pub interior_writes: u64,
    /// Number of blocks freed
    pub blocks_freed: u64,
    /// Number of commits that wrote a new root
    pub commits: u64,
}

/// Thread-safe counting implementation of [`TreeMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    leaf_splits: AtomicU64,
    interior_splits: AtomicU64,
    leaf_merges: AtomicU64,
    interior_merges: AtomicU64,
    upgrades: AtomicU64,
    grows: AtomicU64,
    shrinks: AtomicU64,
    downgrades: AtomicU64,
    leaf_loads: AtomicU64,
    interior_loads: AtomicU64,
    leaf_writes: AtomicU64,
    interior_writes: AtomicU64,
    blocks_freed: AtomicU64,
    commits: AtomicU64,
}

impl CounterMetrics {
    /// Creates a sink with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        TreeStatsSnapshot {
            leaf_splits: load(&self.leaf_splits),
            interior_splits: load(&self.interior_splits),
            leaf_merges: load(&self.leaf_merges),
            interior_merges: load(&self.interior_merges),
            upgrades: load(&self.upgrades),
            grows: load(&self.grows),
            shrinks: load(&self.shrinks),
            downgrades: load(&self.downgrades),
            leaf_loads: load(&self.leaf_loads),
            interior_loads: load(&self.interior_loads),
            leaf_writes: load(&self.leaf_writes),
            interior_writes: load(&self.interior_writes),
            blocks_freed: load(&self.blocks_freed),
            commits: load(&self.commits),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "tessera::btree::stats",
            leaf_splits = snapshot.leaf_splits,
            interior_splits = snapshot.interior_splits,
            leaf_merges = snapshot.leaf_merges,
            interior_merges = snapshot.interior_merges,
            upgrades = snapshot.upgrades,
            grows = snapshot.grows,
            shrinks = snapshot.shrinks,
            downgrades = snapshot.downgrades,
            leaf_loads = snapshot.leaf_loads,
            interior_loads = snapshot.interior_loads,
            leaf_writes = snapshot.leaf_writes,
            interior_writes = snapshot.interior_writes,
            blocks_freed = snapshot.blocks_freed,
            commits = snapshot.commits,
            "btree stats snapshot"
        );
    }

    fn by_kind<'a>(kind: NodeKind, leaf: &'a AtomicU64, interior: &'a AtomicU64) -> &'a AtomicU64 {
        match kind {
            NodeKind::Leaf => leaf,
            NodeKind::Interior => interior,
        }
    }
}

impl TreeMetrics for CounterMetrics {
    fn node_split(&self, kind: NodeKind) {
        Self::by_kind(kind, &self.leaf_splits, &self.interior_splits)
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn node_merged(&self, kind: NodeKind) {
        Self::by_kind(kind, &self.leaf_merges, &self.interior_merges)
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn upgraded(&self) {
        self.upgrades.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn grew(&self) {
        self.grows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn shrank(&self) {
        self.shrinks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn downgraded(&self) {
        self.downgrades.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn node_loaded(&self, kind: NodeKind) {
        Self::by_kind(kind, &self.leaf_loads, &self.interior_loads)
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn node_written(&self, kind: NodeKind) {
        Self::by_kind(kind, &self.leaf_writes, &self.interior_writes)
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn block_freed(&self) {
        self.blocks_freed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn committed(&self) {
        self.commits.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_by_kind() {
        let metrics = CounterMetrics::new();
        metrics.node_split(NodeKind::Leaf);
        metrics.node_split(NodeKind::Leaf);
        metrics.node_split(NodeKind::Interior);
        metrics.node_loaded(NodeKind::Interior);
        metrics.block_freed();
        let snap = metrics.snapshot();
        assert_eq!(snap.leaf_splits, 2);
        assert_eq!(snap.interior_splits, 1);
        assert_eq!(snap.interior_loads, 1);
        assert_eq!(snap.leaf_loads, 0);
        assert_eq!(snap.blocks_freed, 1);
        metrics.emit_tracing();
    }
}
