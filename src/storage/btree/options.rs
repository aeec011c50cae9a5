use serde::{Deserialize, Serialize};

use super::block_map::{entry_footprint, HEADER_LEN, MAX_CAPACITY, MAX_KEY_LEN, MAX_VALUE_LEN};
use super::node::SEPARATOR_VALUE_LEN;
use crate::primitives::block::{Compressor, Location};
use crate::types::{Result, TesseraError};

/// Configuration record for a tree.
///
/// The caller owns persistence of this record: it is read when the tree is
/// opened and `root` is updated by every commit that writes a new root.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Ceiling on key length plus marshalled value length (tag + payload).
    pub max_entry_size: usize,
    /// Block capacity of leaf nodes.
    pub leaf_capacity: usize,
    /// Used-space budget of interior nodes; exceeding it triggers a split.
    pub interior_budget: usize,
    /// Compressor selection for leaf blocks.
    pub leaf_compressor: Compressor,
    /// Compressor selection for interior blocks.
    pub interior_compressor: Compressor,
    /// Location of the last committed root, if any.
    pub root: Option<Location>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_entry_size: 1024,
            leaf_capacity: 8192,
            interior_budget: 8192,
            leaf_compressor: Compressor::None,
            interior_compressor: Compressor::None,
            root: None,
        }
    }
}

impl TreeConfig {
    /// Sets the per-entry ceiling.
    pub fn max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }

    /// Sets the leaf block capacity.
    pub fn leaf_capacity(mut self, bytes: usize) -> Self {
        self.leaf_capacity = bytes;
        self
    }

    /// Sets the interior used-space budget.
    pub fn interior_budget(mut self, bytes: usize) -> Self {
        self.interior_budget = bytes;
        self
    }

    /// Sets the compressor selection for both node kinds.
    pub fn compressor(mut self, compressor: Compressor) -> Self {
        self.leaf_compressor = compressor;
        self.interior_compressor = compressor;
        self
    }

    /// Longest separator key an interior node may have to hold.
    pub fn max_separator_key(&self) -> usize {
        self.max_entry_size.saturating_sub(1).min(MAX_KEY_LEN)
    }

    /// Capacity of freshly allocated interior blocks: the budget plus room for
    /// the separators a single descent can add before the parent rebalances.
    pub fn interior_capacity(&self) -> usize {
        self.interior_budget + 2 * entry_footprint(self.max_separator_key(), SEPARATOR_VALUE_LEN)
    }

    /// Rejects records for which splitting could fail to make progress.
    pub fn validate(&self) -> Result<()> {
        if self.max_entry_size < 1 {
            return Err(TesseraError::Invalid("max_entry_size must allow a type tag"));
        }
        if self.max_entry_size > MAX_KEY_LEN + MAX_VALUE_LEN {
            return Err(TesseraError::Invalid("max_entry_size exceeds block entry limits"));
        }
        let widest_entry = entry_footprint(0, self.max_entry_size);
        if self.leaf_capacity < HEADER_LEN + 2 * widest_entry {
            return Err(TesseraError::Invalid(
                "leaf_capacity must hold two maximum-size entries",
            ));
        }
        if self.leaf_capacity > MAX_CAPACITY {
            return Err(TesseraError::Invalid("leaf_capacity exceeds u32 offsets"));
        }
        let widest_separator = entry_footprint(self.max_separator_key(), SEPARATOR_VALUE_LEN);
        if self.interior_budget < HEADER_LEN + 4 * widest_separator {
            return Err(TesseraError::Invalid(
                "interior_budget must hold four maximum-size separators",
            ));
        }
        if self.interior_capacity() > MAX_CAPACITY {
            return Err(TesseraError::Invalid("interior capacity exceeds u32 offsets"));
        }
        Ok(())
    }
}
