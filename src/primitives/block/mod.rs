#![forbid(unsafe_code)]
//! Block device interface consumed by the B-tree.
//!
//! The tree never addresses storage directly: it hands finished node buffers to
//! a [`BlockStore`] and keeps the returned [`Location`] in the parent node (or
//! in the tree configuration, for the root).

use serde::{Deserialize, Serialize};

use crate::types::{Result, TesseraError};

mod file;
mod mem;

pub use file::{FileBlockStore, BLOCK_FRAME_LEN};
pub use mem::MemBlockStore;

/// Length of a marshalled [`Location`].
pub const LOCATION_LEN: usize = 21;

/// Persisted node-kind tag carried by every location.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Level-0 node holding real key/value entries.
    Leaf = 1,
    /// Node holding separator keys and child locations.
    Interior = 2,
}

impl NodeKind {
    /// Decodes a persisted tag.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Leaf),
            2 => Ok(Self::Interior),
            _ => Err(TesseraError::Corruption("unknown node kind tag")),
        }
    }
}

/// Compressor selection handed through to the block device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Compressor {
    /// Store the block as-is.
    #[default]
    None,
    /// Snappy framing, if the device supports it.
    Snappy,
    /// Zstandard, if the device supports it.
    Zstd,
}

/// Opaque handle to a persisted block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Physical address understood by the block device.
    pub address: u64,
    /// Transaction that wrote the block.
    pub txn: u64,
    /// Kind of node stored in the block.
    pub kind: NodeKind,
    /// Logical size of the block payload in bytes.
    pub size: u32,
}

impl Location {
    /// Writes the fixed-width big-endian form of `loc` into `dst`.
    ///
    /// `None` marshals to all zeroes and marks a node that has not been
    /// persisted yet.
    pub fn marshal(loc: Option<&Location>, dst: &mut [u8; LOCATION_LEN]) {
        dst.fill(0);
        if let Some(loc) = loc {
            dst[0..8].copy_from_slice(&loc.address.to_be_bytes());
            dst[8..16].copy_from_slice(&loc.txn.to_be_bytes());
            dst[16] = loc.kind as u8;
            dst[17..21].copy_from_slice(&loc.size.to_be_bytes());
        }
    }

    /// Parses a marshalled location, returning `None` for the unassigned form.
    pub fn unmarshal(src: &[u8]) -> Result<Option<Location>> {
        if src.len() != LOCATION_LEN {
            return Err(TesseraError::Corruption("location has wrong length"));
        }
        if src.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let address = u64::from_be_bytes(src[0..8].try_into().unwrap());
        let txn = u64::from_be_bytes(src[8..16].try_into().unwrap());
        let kind = NodeKind::from_u8(src[16])?;
        let size = u32::from_be_bytes(src[17..21].try_into().unwrap());
        Ok(Some(Location {
            address,
            txn,
            kind,
            size,
        }))
    }
}

/// Block-level read/write/free interface.
pub trait BlockStore: Send + Sync {
    /// Returns the bytes previously written at `location`.
    fn read_block(&self, location: &Location) -> Result<Vec<u8>>;

    /// Persists `bytes` as a new block and returns its location.
    fn write_block(
        &self,
        bytes: &[u8],
        level: u16,
        kind: NodeKind,
        compressor: Compressor,
    ) -> Result<Location>;

    /// Releases the block at `location`.
    fn free_block(&self, location: &Location) -> Result<()>;

    /// Makes every write and free so far durable and starts a new transaction.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_marshal_roundtrip() -> Result<()> {
        let loc = Location {
            address: 0x0102_0304_0506_0708,
            txn: 9,
            kind: NodeKind::Interior,
            size: 4096,
        };
        let mut buf = [0u8; LOCATION_LEN];
        Location::marshal(Some(&loc), &mut buf);
        assert_eq!(&buf[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf[16], 2);
        assert_eq!(Location::unmarshal(&buf)?, Some(loc));
        Ok(())
    }

    #[test]
    fn unassigned_location_is_all_zero() -> Result<()> {
        let mut buf = [0xAAu8; LOCATION_LEN];
        Location::marshal(None, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(Location::unmarshal(&buf)?, None);
        Ok(())
    }

    #[test]
    fn unknown_kind_tag_is_corruption() {
        let mut buf = [0u8; LOCATION_LEN];
        buf[0] = 1;
        buf[16] = 9;
        let err = Location::unmarshal(&buf).unwrap_err();
        assert!(matches!(err, TesseraError::Corruption(_)));
    }
}
