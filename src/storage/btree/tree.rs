use std::ops::Bound;
use std::sync::Arc;

use super::block_map::MapPut;
use super::entry::{Entry, EntryRef, Value};
use super::node::{InteriorNode, Node, TreeIo, WriteCtx, SENTINEL};
use super::options::TreeConfig;
use super::stats::{NoopMetrics, TreeMetrics};
use super::visit::{EntryCounter, NodeInfo, TreeVisitor, Visit};
use crate::primitives::block::{BlockStore, Location};
use crate::types::{Result, TesseraError};

/// Persistent copy-on-write B-tree over an abstract block store.
///
/// Mutations stay in memory until [`BTree::commit`] writes every dirty node
/// to fresh blocks and records the new root in the configuration record.
/// [`BTree::rollback`] discards them and reloads the last committed root.
///
/// The tree does no internal locking: callers serialize writers, and may run
/// readers concurrently only while no writer holds the tree mutably.
pub struct BTree {
    store: Arc<dyn BlockStore>,
    metrics: Arc<dyn TreeMetrics>,
    config: TreeConfig,
    root: Node,
    /// Blocks the uncommitted tree no longer uses; dropped by rollback.
    pending_frees: Vec<Location>,
    /// Blocks superseded by a recorded root but not yet released to the store.
    superseded: Vec<Location>,
    closed: bool,
}

impl BTree {
    /// Opens the tree described by `config`, or an empty one if it has never
    /// been committed.
    pub fn open(store: &Arc<dyn BlockStore>, config: TreeConfig) -> Result<Self> {
        Self::with_metrics(store, config, Arc::new(NoopMetrics))
    }

    /// Like [`BTree::open`], reporting structural events to `metrics`.
    pub fn with_metrics(
        store: &Arc<dyn BlockStore>,
        config: TreeConfig,
        metrics: Arc<dyn TreeMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::clone(store);
        let io = TreeIo {
            store: store.as_ref(),
            metrics: metrics.as_ref(),
        };
        let root = load_root(io, &config)?;
        tracing::debug!(
            target: "tessera::btree",
            root = ?config.root.map(|l| l.address),
            level = root.level(),
            "opened tree"
        );
        Ok(Self {
            store,
            metrics,
            config,
            root,
            pending_frees: Vec::new(),
            superseded: Vec::new(),
            closed: false,
        })
    }

    fn io(&self) -> TreeIo<'_> {
        TreeIo {
            store: self.store.as_ref(),
            metrics: self.metrics.as_ref(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(TesseraError::Closed);
        }
        Ok(())
    }

    /// The configuration record, with `root` reflecting the last commit.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Level of the root node; 0 while the root is a leaf.
    pub fn height(&self) -> u16 {
        self.root.level()
    }

    /// Snapshot of the root node.
    pub fn root_info(&self) -> NodeInfo<'_> {
        self.root.info()
    }

    /// Whether the tree holds changes that have not been committed.
    pub fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }

    /// Looks up `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.ensure_open()?;
        self.root.get(self.io(), key)
    }

    /// Stores `value` under `key`, returning the value it replaced.
    pub fn put(&mut self, key: &[u8], value: &Value) -> Result<Option<Value>> {
        self.ensure_open()?;
        let len = key.len() + value.marshalled_len();
        if len > self.config.max_entry_size {
            return Err(TesseraError::EntryTooLarge {
                len,
                max: self.config.max_entry_size,
            });
        }
        let mut ctx = WriteCtx {
            io: TreeIo {
                store: self.store.as_ref(),
                metrics: self.metrics.as_ref(),
            },
            config: &self.config,
            freed: &mut self.pending_frees,
        };
        loop {
            match &mut self.root {
                Node::Leaf(leaf) => match leaf.put(key, value.view())? {
                    MapPut::Inserted => return Ok(None),
                    MapPut::Replaced(previous) => return Ok(Some(previous)),
                    MapPut::NoSpace => InteriorNode::raise(&mut self.root, &mut ctx)?,
                },
                Node::Interior(inner) => {
                    if inner.map.used_space() <= ctx.config.interior_budget {
                        return inner.put(&mut ctx, key, value.view());
                    }
                    InteriorNode::raise(&mut self.root, &mut ctx)?;
                }
            }
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Value>> {
        self.ensure_open()?;
        let mut ctx = WriteCtx {
            io: TreeIo {
                store: self.store.as_ref(),
                metrics: self.metrics.as_ref(),
            },
            config: &self.config,
            freed: &mut self.pending_frees,
        };
        let removed = match &mut self.root {
            Node::Leaf(leaf) => leaf.remove(key)?,
            Node::Interior(inner) => inner.remove(&mut ctx, key)?,
        };
        if removed.is_some() {
            collapse_root(&mut self.root, &mut ctx)?;
        }
        Ok(removed)
    }

    /// Walks every node depth-first. Returns [`Visit::Stop`] if a hook ended
    /// the walk early.
    pub fn visit(&self, visitor: &mut dyn TreeVisitor) -> Result<Visit> {
        self.ensure_open()?;
        self.root.visit(self.io(), visitor)
    }

    /// Calls `f` for every entry within the bounds, in key order, until it
    /// returns [`Visit::Stop`].
    pub fn scan<F>(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>, mut f: F) -> Result<()>
    where
        F: FnMut(EntryRef<'_>) -> Visit,
    {
        self.ensure_open()?;
        self.root.scan(self.io(), lower, upper, &mut f)?;
        Ok(())
    }

    /// Entry with the smallest key.
    pub fn first(&self) -> Result<Option<Entry>> {
        self.ensure_open()?;
        self.root.first(self.io())
    }

    /// Entry with the largest key.
    pub fn last(&self) -> Result<Option<Entry>> {
        self.ensure_open()?;
        self.root.last(self.io())
    }

    /// Number of stored entries, counted leaf by leaf.
    pub fn size(&self) -> Result<u64> {
        let mut counter = EntryCounter::default();
        self.visit(&mut counter)?;
        Ok(counter.entries)
    }

    /// Validates every reachable node, returning the first problem found.
    pub fn integrity_check(&self) -> Result<Option<String>> {
        self.ensure_open()?;
        let report = self.root.check(self.io(), SENTINEL, None)?;
        if let Some(report) = &report {
            tracing::error!(target: "tessera::btree", %report, "integrity check failed");
        }
        Ok(report)
    }

    /// Writes every dirty node to fresh blocks and records the new root.
    ///
    /// Returns false when nothing changed. Blocks superseded since the
    /// previous commit are freed only after the new root is recorded; if a
    /// free or the final sync fails, the new root stays committed and the
    /// remaining frees are retried by the next commit.
    pub fn commit(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if !self.root.is_dirty() {
            if !self.superseded.is_empty() {
                self.release_superseded()?;
            }
            return Ok(false);
        }
        let mut ctx = WriteCtx {
            io: TreeIo {
                store: self.store.as_ref(),
                metrics: self.metrics.as_ref(),
            },
            config: &self.config,
            freed: &mut self.pending_frees,
        };
        self.root.commit(&mut ctx)?;
        let root = self
            .root
            .location()
            .ok_or(TesseraError::Corruption("committed root has no location"))?;
        self.config.root = Some(root);
        self.root.finish_commit();
        self.superseded.append(&mut self.pending_frees);
        self.metrics.committed();
        let freed = self.release_superseded()?;
        tracing::info!(
            target: "tessera::btree",
            root = root.address,
            txn = root.txn,
            level = self.root.level(),
            freed,
            "committed tree"
        );
        Ok(true)
    }

    /// Frees every superseded block, then syncs the store. A block leaves the
    /// queue only once the store has released it.
    fn release_superseded(&mut self) -> Result<usize> {
        let mut released = 0;
        while let Some(location) = self.superseded.last() {
            if let Err(err) = self.store.free_block(location) {
                tracing::warn!(
                    target: "tessera::btree",
                    address = location.address,
                    remaining = self.superseded.len(),
                    %err,
                    "failed to free superseded block"
                );
                return Err(err);
            }
            self.superseded.pop();
            self.metrics.block_freed();
            released += 1;
        }
        self.store.sync()?;
        Ok(released)
    }

    /// Discards uncommitted changes and reloads the last committed root.
    ///
    /// Frees still owed by an earlier commit stay queued for the next one.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let discarded = self.pending_frees.len();
        self.pending_frees.clear();
        self.root = load_root(self.io(), &self.config)?;
        tracing::info!(
            target: "tessera::btree",
            root = ?self.config.root.map(|l| l.address),
            discarded_frees = discarded,
            "rolled back tree"
        );
        Ok(())
    }

    /// Closes the tree, dropping uncommitted changes. Later calls fail with
    /// [`TesseraError::Closed`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_frees.clear();
        tracing::debug!(target: "tessera::btree", dirty = self.root.is_dirty(), "closed tree");
    }

    /// Whether [`BTree::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn load_root(io: TreeIo<'_>, config: &TreeConfig) -> Result<Node> {
    match config.root {
        Some(location) => Node::load_root(io, location),
        None => Node::empty_leaf(config),
    }
}

/// Replaces an interior root by its only child for as long as the root has
/// one; a root with two children is first merged when they fit together.
fn collapse_root(root: &mut Node, ctx: &mut WriteCtx<'_>) -> Result<()> {
    loop {
        let Node::Interior(inner) = root else {
            return Ok(());
        };
        if inner.map.len() == 2 && inner.merge_fits(ctx, 0)? {
            inner.merge_children(ctx, 0)?;
        }
        if inner.map.len() != 1 {
            return Ok(());
        }
        let level = inner.meta.level;
        let retired = inner.meta.location;
        let mut child = inner.take_only_child(ctx.io)?;
        child.meta_mut().dirty = true;
        ctx.release(retired);
        *root = child;
        if level == 1 {
            ctx.io.metrics.downgraded();
        } else {
            ctx.io.metrics.shrank();
        }
        tracing::debug!(target: "tessera::btree", from_level = level, "collapsed root");
    }
}
