use std::collections::HashMap;

use parking_lot::Mutex;

use super::{BlockStore, Compressor, Location, NodeKind};
use crate::types::{Result, TesseraError};

struct StoredBlock {
    bytes: Vec<u8>,
    kind: NodeKind,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<u64, StoredBlock>,
    next_address: u64,
    txn: u64,
    reads: u64,
    writes: u64,
    frees: u64,
}

/// Block store that keeps every block in memory.
#[derive(Default)]
pub struct MemBlockStore {
    inner: Mutex<Inner>,
}

impl MemBlockStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks currently allocated.
    pub fn live_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Total number of block reads served.
    pub fn reads(&self) -> u64 {
        self.inner.lock().reads
    }

    /// Total number of block writes served.
    pub fn writes(&self) -> u64 {
        self.inner.lock().writes
    }

    /// Total number of block frees served.
    pub fn frees(&self) -> u64 {
        self.inner.lock().frees
    }

    /// Current transaction id.
    pub fn txn(&self) -> u64 {
        self.inner.lock().txn
    }
}

impl BlockStore for MemBlockStore {
    fn read_block(&self, location: &Location) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.reads += 1;
        let block = inner
            .blocks
            .get(&location.address)
            .ok_or(TesseraError::BlockNotFound(location.address))?;
        if block.kind != location.kind {
            return Err(TesseraError::NodeKindMismatch {
                expected: location.kind,
                found: block.kind,
            });
        }
        Ok(block.bytes.clone())
    }

    fn write_block(
        &self,
        bytes: &[u8],
        _level: u16,
        kind: NodeKind,
        _compressor: Compressor,
    ) -> Result<Location> {
        let size = u32::try_from(bytes.len())
            .map_err(|_| TesseraError::Invalid("block larger than u32"))?;
        let mut inner = self.inner.lock();
        inner.next_address += 1;
        let address = inner.next_address;
        inner.blocks.insert(
            address,
            StoredBlock {
                bytes: bytes.to_vec(),
                kind,
            },
        );
        inner.writes += 1;
        Ok(Location {
            address,
            txn: inner.txn,
            kind,
            size,
        })
    }

    fn free_block(&self, location: &Location) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.blocks.remove(&location.address).is_none() {
            return Err(TesseraError::BlockNotFound(location.address));
        }
        inner.frees += 1;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.inner.lock().txn += 1;
        Ok(())
    }
}
