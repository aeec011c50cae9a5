//! Embedded persistent key-value engine built around a copy-on-write B-tree.
//!
//! [`storage::btree::BTree`] maps byte-string keys to tagged values stored in
//! fixed-capacity sorted blocks, persisted through a [`primitives::block::BlockStore`].

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;
