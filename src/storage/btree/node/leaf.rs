use std::cmp::Ordering;
use std::ops::Bound;

use super::{past_upper, NodeMeta, WriteCtx};
use crate::primitives::block::NodeKind;
use crate::storage::btree::block_map::{MapPut, SortedBlockMap, HEADER_LEN};
use crate::storage::btree::entry::{compare_keys, EntryRef, Value, ValueRef};
use crate::storage::btree::options::TreeConfig;
use crate::storage::btree::visit::Visit;
use crate::types::{Result, TesseraError};

/// Level-0 node whose entries are the stored key/value pairs.
#[derive(Debug)]
pub(crate) struct LeafNode {
    pub(crate) meta: NodeMeta,
    pub(crate) map: SortedBlockMap,
}

impl LeafNode {
    pub(crate) fn empty(config: &TreeConfig) -> Result<Self> {
        Ok(Self {
            meta: NodeMeta::fresh(0),
            map: SortedBlockMap::create(config.leaf_capacity)?,
        })
    }

    pub(crate) fn from_parts(meta: NodeMeta, map: SortedBlockMap) -> Self {
        Self { meta, map }
    }

    /// Inserts or replaces `key`; [`MapPut::NoSpace`] leaves the leaf untouched.
    pub(crate) fn put(&mut self, key: &[u8], value: ValueRef<'_>) -> Result<MapPut> {
        let outcome = self.map.put(key, value)?;
        if outcome != MapPut::NoSpace {
            self.meta.dirty = true;
        }
        Ok(outcome)
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> Result<Option<Value>> {
        let removed = self.map.remove(key)?;
        if removed.is_some() {
            self.meta.dirty = true;
        }
        Ok(removed)
    }

    /// Moves the upper half of the entries into a new sibling, returning the
    /// sibling's lowest key with it. `self` keeps its location.
    pub(crate) fn split(&mut self, config: &TreeConfig) -> Result<(Vec<u8>, LeafNode)> {
        if self.map.len() < 2 {
            return Err(TesseraError::Corruption("leaf split needs two entries"));
        }
        let capacity = self.map.capacity().max(config.leaf_capacity);
        let (left, right) = self.map.split(capacity)?;
        let right_key = right.key_at(0)?.to_vec();
        self.map = left;
        self.meta.dirty = true;
        let sibling = LeafNode {
            meta: NodeMeta::fresh(0),
            map: right,
        };
        Ok((right_key, sibling))
    }

    /// True when `upper` (the right sibling) can be folded into this leaf.
    pub(crate) fn can_absorb(&self, upper: &LeafNode) -> bool {
        self.map.used_space() + upper.map.used_space() - HEADER_LEN <= self.map.capacity()
    }

    /// Appends every entry of the right sibling `donor`.
    pub(crate) fn absorb(&mut self, donor: LeafNode) -> Result<()> {
        for entry in donor.map.iter() {
            let entry = entry?;
            if self.map.append(entry.key, entry.value)? == MapPut::NoSpace {
                return Err(TesseraError::Corruption("merged leaf overflowed"));
            }
        }
        self.meta.dirty = true;
        Ok(())
    }

    pub(crate) fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        f: &mut dyn FnMut(EntryRef<'_>) -> Visit,
    ) -> Result<Visit> {
        let start = match lower {
            Bound::Unbounded => 0,
            Bound::Included(key) => match self.map.search(key)? {
                Ok(idx) | Err(idx) => idx,
            },
            Bound::Excluded(key) => match self.map.search(key)? {
                Ok(idx) => idx + 1,
                Err(idx) => idx,
            },
        };
        for idx in start..self.map.len() {
            let entry = self.map.entry_at(idx)?;
            if past_upper(entry.key, upper) || f(entry) == Visit::Stop {
                return Ok(Visit::Stop);
            }
        }
        Ok(Visit::Continue)
    }

    pub(crate) fn check_bounds(&self, lower: &[u8], upper: Option<&[u8]>) -> Result<Option<String>> {
        let (Some(first), Some(last)) = (self.map.first()?, self.map.last()?) else {
            return Ok(None);
        };
        if compare_keys(first.key, lower) == Ordering::Less {
            return Ok(Some(format!(
                "leaf key {:?} sorts below its separator {:?}",
                first.key, lower
            )));
        }
        if let Some(upper) = upper {
            if compare_keys(last.key, upper) != Ordering::Less {
                return Ok(Some(format!(
                    "leaf key {:?} reaches the next separator {:?}",
                    last.key, upper
                )));
            }
        }
        Ok(None)
    }

    pub(crate) fn commit(&mut self, ctx: &mut WriteCtx<'_>) -> Result<bool> {
        if !self.meta.dirty {
            return Ok(false);
        }
        ctx.release(self.meta.location.take());
        let location = ctx.io.store.write_block(
            self.map.as_bytes(),
            0,
            NodeKind::Leaf,
            ctx.config.leaf_compressor,
        )?;
        ctx.io.metrics.node_written(NodeKind::Leaf);
        self.meta.location = Some(location);
        Ok(true)
    }
}
