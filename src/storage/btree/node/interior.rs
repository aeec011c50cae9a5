use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use super::{
    decode_location, encode_location, past_upper, ChildRef, Node, NodeMeta, TreeIo, WriteCtx,
    LOCATION_TAG, SENTINEL, SEPARATOR_VALUE_LEN,
};
use crate::primitives::block::{Location, NodeKind};
use crate::storage::btree::block_map::{entry_footprint, MapPut, SortedBlockMap, HEADER_LEN};
use crate::storage::btree::entry::{compare_keys, Entry, EntryRef, Value, ValueRef};
use crate::storage::btree::options::TreeConfig;
use crate::storage::btree::visit::Visit;
use crate::types::{Result, TesseraError};

/// Node at level >= 1 mapping separator keys to child locations.
///
/// Entry `i` covers keys in `[separator(i), separator(i + 1))`; entry 0 always
/// carries the empty sentinel key. Children dereferenced by a mutating descent
/// stay in `children`, keyed by their separator, until the next commit.
#[derive(Debug)]
pub(crate) struct InteriorNode {
    pub(crate) meta: NodeMeta,
    pub(crate) map: SortedBlockMap,
    children: BTreeMap<Vec<u8>, Node>,
}

enum Descent {
    Split,
    Done(Option<Value>),
}

impl InteriorNode {
    pub(crate) fn from_parts(meta: NodeMeta, map: SortedBlockMap) -> Self {
        Self {
            meta,
            map,
            children: BTreeMap::new(),
        }
    }

    /// Splits `root` and installs a new root one level higher above both halves.
    pub(crate) fn raise(root: &mut Node, ctx: &mut WriteCtx<'_>) -> Result<()> {
        let level = root
            .level()
            .checked_add(1)
            .ok_or(TesseraError::Invalid("tree height exceeds u16 levels"))?;
        let kind = root.kind();
        let (right_key, right) = match root {
            Node::Leaf(leaf) => {
                let (key, sibling) = leaf.split(ctx.config)?;
                (key, Node::Leaf(sibling))
            }
            Node::Interior(inner) => {
                let (key, sibling) = inner.split(ctx.config)?;
                (key, Node::Interior(sibling))
            }
        };
        let mut parent = InteriorNode::from_parts(
            NodeMeta::fresh(level),
            SortedBlockMap::create(ctx.config.interior_capacity())?,
        );
        parent.insert_separator(SENTINEL, root.location().as_ref())?;
        parent.insert_separator(&right_key, None)?;
        parent.children.insert(right_key, right);
        let left = std::mem::replace(root, Node::Interior(parent));
        if let Node::Interior(parent) = root {
            parent.children.insert(SENTINEL.to_vec(), left);
        }
        match kind {
            NodeKind::Leaf => ctx.io.metrics.upgraded(),
            NodeKind::Interior => ctx.io.metrics.grew(),
        }
        tracing::debug!(target: "tessera::btree", level, ?kind, "raised root");
        Ok(())
    }

    fn child_level(&self) -> u16 {
        self.meta.level - 1
    }

    /// Index of the separator covering `key`.
    fn locate(&self, key: &[u8]) -> Result<usize> {
        self.map
            .nearest(key)?
            .index()
            .ok_or(TesseraError::Corruption("interior node missing sentinel"))
    }

    fn child_location(&self, idx: usize) -> Result<Location> {
        decode_location(self.map.entry_at(idx)?.value)?
            .ok_or(TesseraError::Corruption("uncached child has no location"))
    }

    /// Child `idx` for a read-only descent; nothing is added to the cache.
    pub(crate) fn child_for_read(&self, io: TreeIo<'_>, idx: usize) -> Result<ChildRef<'_>> {
        if let Some(child) = self.children.get(self.map.key_at(idx)?) {
            return Ok(ChildRef::Cached(child));
        }
        let location = self.child_location(idx)?;
        Ok(ChildRef::Loaded(Box::new(Node::load(
            io,
            location,
            self.child_level(),
        )?)))
    }

    /// Materializes child `idx` into the cache, returning its separator key.
    fn ensure_child(&mut self, io: TreeIo<'_>, idx: usize) -> Result<Vec<u8>> {
        let key = self.map.key_at(idx)?.to_vec();
        if !self.children.contains_key(&key) {
            let child = Node::load(io, self.child_location(idx)?, self.child_level())?;
            self.children.insert(key.clone(), child);
        }
        Ok(key)
    }

    fn cached(&self, key: &[u8]) -> Result<&Node> {
        self.children
            .get(key)
            .ok_or(TesseraError::Corruption("child missing from cache"))
    }

    fn cached_mut(&mut self, key: &[u8]) -> Result<&mut Node> {
        self.children
            .get_mut(key)
            .ok_or(TesseraError::Corruption("child missing from cache"))
    }

    /// Adds a separator, growing the block when the entry does not fit.
    fn insert_separator(&mut self, key: &[u8], location: Option<&Location>) -> Result<()> {
        let payload = encode_location(location);
        let value = ValueRef {
            tag: LOCATION_TAG,
            payload: &payload,
        };
        let mut outcome = self.map.put(key, value)?;
        if outcome == MapPut::NoSpace {
            let grown = self.map.capacity() + entry_footprint(key.len(), SEPARATOR_VALUE_LEN);
            self.map = self.map.resized(grown)?;
            outcome = self.map.put(key, value)?;
        }
        match outcome {
            MapPut::Inserted => Ok(()),
            MapPut::Replaced(_) => Err(TesseraError::Corruption("duplicate separator key")),
            MapPut::NoSpace => Err(TesseraError::Invalid("interior node cannot hold separator")),
        }
    }

    pub(crate) fn get(&self, io: TreeIo<'_>, key: &[u8]) -> Result<Option<Value>> {
        let child = self.child_for_read(io, self.locate(key)?)?;
        child.get(io, key)
    }

    pub(crate) fn first(&self, io: TreeIo<'_>) -> Result<Option<Entry>> {
        for idx in 0..self.map.len() {
            if let Some(entry) = self.child_for_read(io, idx)?.first(io)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub(crate) fn last(&self, io: TreeIo<'_>) -> Result<Option<Entry>> {
        for idx in (0..self.map.len()).rev() {
            if let Some(entry) = self.child_for_read(io, idx)?.last(io)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub(crate) fn scan(
        &self,
        io: TreeIo<'_>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        f: &mut dyn FnMut(EntryRef<'_>) -> Visit,
    ) -> Result<Visit> {
        let start = match lower {
            Bound::Unbounded => 0,
            Bound::Included(key) | Bound::Excluded(key) => self.locate(key)?,
        };
        for idx in start..self.map.len() {
            if idx > start && past_upper(self.map.key_at(idx)?, upper) {
                return Ok(Visit::Stop);
            }
            let child = self.child_for_read(io, idx)?;
            if child.scan(io, lower, upper, f)? == Visit::Stop {
                return Ok(Visit::Stop);
            }
        }
        Ok(Visit::Continue)
    }

    /// Inserts or replaces `key` below this node, splitting overflowing
    /// children on the way down.
    pub(crate) fn put(
        &mut self,
        ctx: &mut WriteCtx<'_>,
        key: &[u8],
        value: ValueRef<'_>,
    ) -> Result<Option<Value>> {
        loop {
            let idx = self.locate(key)?;
            let sep = self.ensure_child(ctx.io, idx)?;
            let step = match self.cached_mut(&sep)? {
                Node::Interior(inner) => {
                    if inner.map.used_space() > ctx.config.interior_budget {
                        Descent::Split
                    } else {
                        Descent::Done(inner.put(ctx, key, value)?)
                    }
                }
                Node::Leaf(leaf) => match leaf.put(key, value)? {
                    MapPut::NoSpace if leaf.map.len() < 2 => {
                        return Err(TesseraError::Corruption("leaf too small for entry"));
                    }
                    MapPut::NoSpace => Descent::Split,
                    MapPut::Inserted => Descent::Done(None),
                    MapPut::Replaced(previous) => Descent::Done(Some(previous)),
                },
            };
            match step {
                Descent::Split => self.split_child(ctx, idx)?,
                Descent::Done(previous) => {
                    self.meta.dirty = true;
                    return Ok(previous);
                }
            }
        }
    }

    /// Splits child `idx` into two siblings, both cached and dirty.
    fn split_child(&mut self, ctx: &mut WriteCtx<'_>, idx: usize) -> Result<()> {
        let sep = self.map.key_at(idx)?.to_vec();
        let child = self
            .children
            .remove(&sep)
            .ok_or(TesseraError::Corruption("child missing from cache"))?;
        let kind = child.kind();
        let (left, right_key, right) = match child {
            Node::Leaf(mut leaf) => {
                let (key, sibling) = leaf.split(ctx.config)?;
                (Node::Leaf(leaf), key, Node::Leaf(sibling))
            }
            Node::Interior(mut inner) => {
                let (key, sibling) = inner.split(ctx.config)?;
                (Node::Interior(inner), key, Node::Interior(sibling))
            }
        };
        self.insert_separator(&right_key, None)?;
        tracing::debug!(
            target: "tessera::btree",
            level = self.meta.level,
            ?kind,
            separators = self.map.len(),
            "split child"
        );
        self.children.insert(sep, left);
        self.children.insert(right_key, right);
        self.meta.dirty = true;
        ctx.io.metrics.node_split(kind);
        Ok(())
    }

    /// Moves the upper half of the separators (and their cached children)
    /// into a new sibling. The sibling's first entry is re-keyed to the
    /// sentinel; its original key is returned as the sibling's separator.
    pub(crate) fn split(&mut self, config: &TreeConfig) -> Result<(Vec<u8>, InteriorNode)> {
        if self.map.len() < 2 {
            return Err(TesseraError::Corruption("interior split needs two entries"));
        }
        let capacity = self.map.capacity().max(config.interior_capacity());
        let (left, mut right) = self.map.split(capacity)?;
        let (right_key, first) = right
            .remove_first()?
            .ok_or(TesseraError::Corruption("interior split produced empty half"))?;
        if right.put(SENTINEL, first.view())? != MapPut::Inserted {
            return Err(TesseraError::Corruption("interior split lost its sentinel"));
        }
        let mut moved = self.children.split_off(right_key.as_slice());
        if let Some(child) = moved.remove(&right_key) {
            moved.insert(SENTINEL.to_vec(), child);
        }
        self.map = left;
        self.meta.dirty = true;
        let sibling = InteriorNode {
            meta: NodeMeta::fresh(self.meta.level),
            map: right,
            children: moved,
        };
        Ok((right_key, sibling))
    }

    /// Removes `key` below this node, merging the affected child with a
    /// sibling when both fit in one node.
    pub(crate) fn remove(&mut self, ctx: &mut WriteCtx<'_>, key: &[u8]) -> Result<Option<Value>> {
        let idx = self.locate(key)?;
        let sep = self.ensure_child(ctx.io, idx)?;
        let removed = match self.cached_mut(&sep)? {
            Node::Leaf(leaf) => leaf.remove(key)?,
            Node::Interior(inner) => inner.remove(ctx, key)?,
        };
        if removed.is_some() {
            self.meta.dirty = true;
            self.rebalance_child(ctx, idx)?;
        }
        Ok(removed)
    }

    /// Merges child `idx` with whichever neighbour leaves more room, if any fits.
    fn rebalance_child(&mut self, ctx: &mut WriteCtx<'_>, idx: usize) -> Result<()> {
        if self.map.len() < 2 {
            return Ok(());
        }
        let mut best: Option<(usize, usize)> = None;
        if idx > 0 && self.merge_fits(ctx, idx - 1)? {
            let free = self.cached(self.map.key_at(idx - 1)?)?.map().free_space();
            best = Some((idx - 1, free));
        }
        if idx + 1 < self.map.len() && self.merge_fits(ctx, idx)? {
            let free = self.cached(self.map.key_at(idx + 1)?)?.map().free_space();
            if best.map_or(true, |(_, left_free)| free > left_free) {
                best = Some((idx, free));
            }
        }
        match best {
            Some((lower, _)) => self.merge_children(ctx, lower),
            None => Ok(()),
        }
    }

    /// True when children `lower` and `lower + 1` fit in a single node.
    /// Loads both into the cache.
    pub(crate) fn merge_fits(&mut self, ctx: &WriteCtx<'_>, lower: usize) -> Result<bool> {
        let lo_key = self.ensure_child(ctx.io, lower)?;
        let hi_key = self.ensure_child(ctx.io, lower + 1)?;
        Ok(match (self.cached(&lo_key)?, self.cached(&hi_key)?) {
            (Node::Leaf(lo), Node::Leaf(hi)) => lo.can_absorb(hi),
            (Node::Interior(lo), Node::Interior(hi)) => {
                lo.merged_len(hi, &hi_key) <= ctx.config.interior_budget
            }
            _ => return Err(TesseraError::Corruption("sibling nodes differ in kind")),
        })
    }

    /// Folds child `lower + 1` into child `lower` and drops its separator.
    pub(crate) fn merge_children(&mut self, ctx: &mut WriteCtx<'_>, lower: usize) -> Result<()> {
        let lo_key = self.map.key_at(lower)?.to_vec();
        let hi_key = self.map.key_at(lower + 1)?.to_vec();
        let donor = self
            .children
            .remove(&hi_key)
            .ok_or(TesseraError::Corruption("child missing from cache"))?;
        let kind = donor.kind();
        let donor_location = donor.location();
        match (self.cached_mut(&lo_key)?, donor) {
            (Node::Leaf(survivor), Node::Leaf(donor)) => survivor.absorb(donor)?,
            (Node::Interior(survivor), Node::Interior(donor)) => {
                survivor.absorb(ctx.config, &hi_key, donor)?
            }
            _ => return Err(TesseraError::Corruption("sibling nodes differ in kind")),
        }
        ctx.release(donor_location);
        self.map.remove_at(lower + 1)?;
        self.meta.dirty = true;
        ctx.io.metrics.node_merged(kind);
        tracing::debug!(
            target: "tessera::btree",
            level = self.meta.level,
            ?kind,
            separators = self.map.len(),
            "merged children"
        );
        Ok(())
    }

    /// Used space after absorbing `upper`, whose sentinel becomes `upper_sep`.
    fn merged_len(&self, upper: &InteriorNode, upper_sep: &[u8]) -> usize {
        self.map.used_space() + upper.map.used_space() - HEADER_LEN + upper_sep.len()
    }

    fn absorb(&mut self, config: &TreeConfig, donor_sep: &[u8], donor: InteriorNode) -> Result<()> {
        let needed = self.merged_len(&donor, donor_sep);
        if needed > self.map.capacity() {
            self.map = self.map.resized(needed.max(config.interior_capacity()))?;
        }
        for (idx, entry) in donor.map.iter().enumerate() {
            let entry = entry?;
            let key = if idx == 0 {
                if !entry.key.is_empty() {
                    return Err(TesseraError::Corruption("interior node missing sentinel"));
                }
                donor_sep
            } else {
                entry.key
            };
            if self.map.append(key, entry.value)? == MapPut::NoSpace {
                return Err(TesseraError::Corruption("merged interior overflowed"));
            }
        }
        for (key, child) in donor.children {
            let key = if key.is_empty() { donor_sep.to_vec() } else { key };
            self.children.insert(key, child);
        }
        self.meta.dirty = true;
        Ok(())
    }

    /// Detaches the child of a node that has exactly one separator.
    pub(crate) fn take_only_child(&mut self, io: TreeIo<'_>) -> Result<Node> {
        if self.map.len() != 1 {
            return Err(TesseraError::Corruption("expected a single child"));
        }
        let key = self.ensure_child(io, 0)?;
        self.children
            .remove(&key)
            .ok_or(TesseraError::Corruption("child missing from cache"))
    }

    pub(crate) fn check(
        &self,
        io: TreeIo<'_>,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> Result<Option<String>> {
        let level = self.meta.level;
        match self.map.first()? {
            None => return Ok(Some(format!("interior node at level {level} has no entries"))),
            Some(first) if first.key != SENTINEL => {
                return Ok(Some(format!(
                    "interior node at level {level} starts with {:?} instead of the sentinel",
                    first.key
                )))
            }
            Some(_) => {}
        }
        let count = self.map.len();
        for idx in 0..count {
            let sep = self.map.key_at(idx)?;
            if idx > 0 {
                let below = compare_keys(sep, lower) != Ordering::Greater;
                let above = upper.is_some_and(|u| compare_keys(sep, u) != Ordering::Less);
                if below || above {
                    return Ok(Some(format!(
                        "separator {sep:?} at level {level} escapes its parent range"
                    )));
                }
            }
            let child_lower = if idx == 0 { lower } else { sep };
            let child_upper = if idx + 1 < count {
                Some(self.map.key_at(idx + 1)?)
            } else {
                upper
            };
            let child = match self.child_for_read(io, idx) {
                Ok(child) => child,
                Err(TesseraError::Io(err)) => return Err(TesseraError::Io(err)),
                Err(err) => {
                    return Ok(Some(format!(
                        "child {idx} of interior node at level {level}: {err}"
                    )))
                }
            };
            if child.level() + 1 != level {
                return Ok(Some(format!(
                    "child {idx} of interior node at level {level} sits at level {}",
                    child.level()
                )));
            }
            if let Some(report) = child.check(io, child_lower, child_upper)? {
                return Ok(Some(report));
            }
        }
        Ok(None)
    }

    /// Writes dirty cached children, then this node, copy-on-write.
    ///
    /// Returns true when a new block was written for this node.
    ///
    /// Separator locations are rewritten with `overwrite_value_at`, which
    /// leaves the modification counter alone, so the counter comparison is
    /// an assertion: it only fails if a structural edit reaches this map
    /// while the commit is folding in children.
    pub(crate) fn commit(&mut self, ctx: &mut WriteCtx<'_>) -> Result<bool> {
        let mods = self.map.modifications();
        for (key, child) in self.children.iter_mut() {
            if !child.commit(ctx)? {
                continue;
            }
            let idx = match self.map.search(key)? {
                Ok(idx) => idx,
                Err(_) => return Err(TesseraError::Corruption("cached child has no separator")),
            };
            let payload = encode_location(child.location().as_ref());
            self.map.overwrite_value_at(
                idx,
                ValueRef {
                    tag: LOCATION_TAG,
                    payload: &payload,
                },
            )?;
            self.meta.dirty = true;
        }
        if self.map.modifications() != mods {
            tracing::error!(
                target: "tessera::btree",
                level = self.meta.level,
                "interior node changed during commit"
            );
            return Err(TesseraError::ConcurrentModification);
        }
        if !self.meta.dirty {
            return Ok(false);
        }
        ctx.release(self.meta.location.take());
        let location = ctx.io.store.write_block(
            self.map.as_bytes(),
            self.meta.level,
            NodeKind::Interior,
            ctx.config.interior_compressor,
        )?;
        ctx.io.metrics.node_written(NodeKind::Interior);
        self.meta.location = Some(location);
        Ok(true)
    }

    pub(crate) fn finish_commit(&mut self) {
        self.meta.dirty = false;
        self.children.clear();
    }

    #[cfg(test)]
    pub(crate) fn cached_children(&self) -> usize {
        self.children.len()
    }
}
