use std::collections::{HashMap, HashSet};
use std::path::Path;

use parking_lot::Mutex;

use super::{BlockStore, Compressor, Location, NodeKind};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::block_crc32;
use crate::types::{Result, TesseraError};

const FILE_MAGIC: [u8; 8] = *b"TSRBLKS1";
const FILE_HEADER_LEN: u64 = 16;
const BLOCK_MAGIC: [u8; 4] = *b"TBLK";

/// Bytes of framing written in front of every block payload.
pub const BLOCK_FRAME_LEN: usize = 16;

struct Inner {
    io: Box<dyn FileIo>,
    end: u64,
    txn: u64,
    /// Extents freed in the current transaction; reusable after the next sync.
    freed_now: Vec<(u64, u32)>,
    /// Reusable extents keyed by payload length.
    reusable: HashMap<u32, Vec<u64>>,
    freed: HashSet<u64>,
}

/// Block store persisting checksummed frames into a single file.
///
/// Freed extents are tracked for the lifetime of the store only and are reused
/// for payloads of identical length once the transaction that freed them has
/// been synced.
pub struct FileBlockStore {
    inner: Mutex<Inner>,
}

impl FileBlockStore {
    /// Opens `path`, creating and initializing it when empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        Self::with_io(Box::new(io))
    }

    /// Builds a store over an arbitrary [`FileIo`].
    pub fn with_io(io: Box<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        let txn = if len == 0 {
            write_file_header(io.as_ref(), 0)?;
            io.sync_all()?;
            0
        } else {
            if len < FILE_HEADER_LEN {
                return Err(TesseraError::Corruption("block file shorter than header"));
            }
            let mut header = [0u8; FILE_HEADER_LEN as usize];
            io.read_at(0, &mut header)?;
            if header[0..8] != FILE_MAGIC {
                return Err(TesseraError::Corruption("block file magic mismatch"));
            }
            u64::from_be_bytes(header[8..16].try_into().unwrap())
        };
        let end = io.len()?;
        tracing::debug!(target: "tessera::block", end, txn, "opened block file");
        Ok(Self {
            inner: Mutex::new(Inner {
                io,
                end,
                txn,
                freed_now: Vec::new(),
                reusable: HashMap::new(),
                freed: HashSet::new(),
            }),
        })
    }

    /// Current transaction id.
    pub fn txn(&self) -> u64 {
        self.inner.lock().txn
    }
}

impl BlockStore for FileBlockStore {
    fn read_block(&self, location: &Location) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        if inner.freed.contains(&location.address)
            || location.address < FILE_HEADER_LEN
            || location.address >= inner.end
        {
            return Err(TesseraError::BlockNotFound(location.address));
        }
        let mut frame = [0u8; BLOCK_FRAME_LEN];
        inner.io.read_at(location.address, &mut frame)?;
        if frame[0..4] != BLOCK_MAGIC {
            return Err(TesseraError::Corruption("block frame magic mismatch"));
        }
        let found = NodeKind::from_u8(frame[4])?;
        if found != location.kind {
            return Err(TesseraError::NodeKindMismatch {
                expected: location.kind,
                found,
            });
        }
        let level = u16::from_be_bytes(frame[5..7].try_into().unwrap());
        let len = u32::from_be_bytes(frame[8..12].try_into().unwrap());
        if len != location.size {
            return Err(TesseraError::Corruption("block length disagrees with location"));
        }
        let expected_crc = u32::from_be_bytes(frame[12..16].try_into().unwrap());
        let mut payload = vec![0u8; len as usize];
        inner
            .io
            .read_at(location.address + BLOCK_FRAME_LEN as u64, &mut payload)?;
        if block_crc32(location.address, frame[4], level, &payload) != expected_crc {
            tracing::error!(
                target: "tessera::block",
                address = location.address,
                "block checksum mismatch"
            );
            return Err(TesseraError::Corruption("block checksum mismatch"));
        }
        Ok(payload)
    }

    fn write_block(
        &self,
        bytes: &[u8],
        level: u16,
        kind: NodeKind,
        _compressor: Compressor,
    ) -> Result<Location> {
        let size = u32::try_from(bytes.len())
            .map_err(|_| TesseraError::Invalid("block larger than u32"))?;
        let mut inner = self.inner.lock();
        let reused = inner.reusable.get_mut(&size).and_then(Vec::pop);
        let address = match reused {
            Some(address) => {
                inner.freed.remove(&address);
                address
            }
            None => {
                let address = inner.end;
                inner.end = address + (BLOCK_FRAME_LEN + bytes.len()) as u64;
                address
            }
        };
        let mut frame = [0u8; BLOCK_FRAME_LEN];
        frame[0..4].copy_from_slice(&BLOCK_MAGIC);
        frame[4] = kind as u8;
        frame[5..7].copy_from_slice(&level.to_be_bytes());
        frame[8..12].copy_from_slice(&size.to_be_bytes());
        let crc = block_crc32(address, kind as u8, level, bytes);
        frame[12..16].copy_from_slice(&crc.to_be_bytes());
        inner.io.write_at(address, &frame)?;
        inner.io.write_at(address + BLOCK_FRAME_LEN as u64, bytes)?;
        Ok(Location {
            address,
            txn: inner.txn,
            kind,
            size,
        })
    }

    fn free_block(&self, location: &Location) -> Result<()> {
        let mut inner = self.inner.lock();
        if location.address < FILE_HEADER_LEN
            || location.address >= inner.end
            || !inner.freed.insert(location.address)
        {
            return Err(TesseraError::BlockNotFound(location.address));
        }
        inner.freed_now.push((location.address, location.size));
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.txn += 1;
        write_file_header(inner.io.as_ref(), inner.txn)?;
        inner.io.sync_all()?;
        let freed: Vec<(u64, u32)> = inner.freed_now.drain(..).collect();
        for (address, size) in freed {
            inner.reusable.entry(size).or_default().push(address);
        }
        Ok(())
    }
}

fn write_file_header(io: &dyn FileIo, txn: u64) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    header[0..8].copy_from_slice(&FILE_MAGIC);
    header[8..16].copy_from_slice(&txn.to_be_bytes());
    io.write_at(0, &header)
}
