//! Fixed-capacity sorted key/value buffer used as the payload of every tree node.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! +-------+--------------+---------------------+-----------+------------------+
//! | count | free offset  | entries (ascending) | zero gap  | offset table     |
//! | u16   | u32          | klen vlen key value |           | u32 per entry    |
//! +-------+--------------+---------------------+-----------+------------------+
//! ```
//!
//! Entries grow forward from the end of the header; the offset table grows
//! backward from the end of the buffer, slot `i` sitting at
//! `capacity - (i + 1) * SLOT_LEN`. Offsets and the free offset are relative to
//! the end of the header. An all-zero buffer is a valid empty map.

use std::cmp::Ordering;
use std::fmt;

use super::entry::{compare_keys, EntryRef, Value, ValueRef};
use crate::types::{Result, TesseraError};

/// Bytes used by the map header (`count:u16` + `free_offset:u32`).
pub const HEADER_LEN: usize = 6;
/// Bytes in front of each entry (`key_len:u16` + `value_len:u16`).
pub const ENTRY_HEADER_LEN: usize = 4;
/// Bytes per offset-table slot.
pub const SLOT_LEN: usize = 4;
/// Longest key a map can store.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;
/// Longest marshalled value (tag plus payload) a map can store.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;
/// Most entries a single map can hold.
pub const MAX_ENTRIES: usize = u16::MAX as usize;
/// Largest capacity whose offsets stay representable.
pub const MAX_CAPACITY: usize = u32::MAX as usize;

// Smallest possible entry: empty key, tag-only value, one slot.
const MIN_ENTRY_FOOTPRINT: usize = ENTRY_HEADER_LEN + 1 + SLOT_LEN;

const COUNT_OFFSET: usize = 0;
const FREE_OFFSET: usize = 2;

/// Bytes an entry consumes in a map, including its offset-table slot.
#[inline]
pub fn entry_footprint(key_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_LEN + key_len + value_len + SLOT_LEN
}

/// Upper bound on the entry count a buffer of `capacity` bytes can hold.
pub fn max_entries_for(capacity: usize) -> usize {
    (capacity.saturating_sub(HEADER_LEN) / MIN_ENTRY_FOOTPRINT).min(MAX_ENTRIES)
}

/// Outcome of [`SortedBlockMap::put`].
#[derive(Debug, Eq, PartialEq)]
pub enum MapPut {
    /// The key was absent and has been inserted.
    Inserted,
    /// The key existed; its previous value is returned.
    Replaced(Value),
    /// The entry does not fit; the map is unchanged.
    NoSpace,
}

/// Outcome of [`SortedBlockMap::nearest`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Nearest {
    /// The key is stored at this index.
    Exact(usize),
    /// The key is absent; this index holds the greatest smaller key and a
    /// greater key follows it.
    Near(usize),
    /// The key is greater than every stored key; this is the last index.
    Last(usize),
    /// Every stored key is greater than the target (or the map is empty).
    Before,
}

impl Nearest {
    /// Index of the greatest stored key `<=` the target, if any.
    pub fn index(self) -> Option<usize> {
        match self {
            Nearest::Exact(idx) | Nearest::Near(idx) | Nearest::Last(idx) => Some(idx),
            Nearest::Before => None,
        }
    }
}

/// Sorted key/value entries packed into a fixed-capacity byte buffer.
#[derive(Clone)]
pub struct SortedBlockMap {
    buf: Vec<u8>,
    count: usize,
    free_offset: usize,
    mods: u64,
}

impl fmt::Debug for SortedBlockMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedBlockMap")
            .field("capacity", &self.buf.len())
            .field("count", &self.count)
            .field("free_offset", &self.free_offset)
            .finish()
    }
}

impl SortedBlockMap {
    /// Allocates an empty map of `capacity` bytes.
    pub fn create(capacity: usize) -> Result<Self> {
        if capacity <= HEADER_LEN {
            return Err(TesseraError::Invalid("block capacity must exceed header"));
        }
        if capacity > MAX_CAPACITY {
            return Err(TesseraError::Invalid("block capacity exceeds u32 offsets"));
        }
        Ok(Self {
            buf: vec![0u8; capacity],
            count: 0,
            free_offset: 0,
            mods: 0,
        })
    }

    /// Takes ownership of a serialized map; the capacity is the buffer length.
    pub fn wrap(bytes: Vec<u8>) -> Result<Self> {
        let capacity = bytes.len();
        if capacity <= HEADER_LEN {
            return Err(TesseraError::Corruption("block shorter than map header"));
        }
        if capacity > MAX_CAPACITY {
            return Err(TesseraError::Corruption("block exceeds u32 offsets"));
        }
        let count = read_u16(&bytes, COUNT_OFFSET) as usize;
        let free_offset = read_u32(&bytes, FREE_OFFSET) as usize;
        if count > max_entries_for(capacity) {
            return Err(TesseraError::Corruption("entry count exceeds block capacity"));
        }
        let used = HEADER_LEN
            .checked_add(free_offset)
            .and_then(|v| v.checked_add(count * SLOT_LEN))
            .ok_or(TesseraError::Corruption("free offset overflow"))?;
        if used > capacity {
            return Err(TesseraError::Corruption("free offset overlaps offset table"));
        }
        Ok(Self {
            buf: bytes,
            count,
            free_offset,
            mods: 0,
        })
    }

    /// Copies `capacity` bytes starting at `offset` out of `bytes` and wraps them.
    pub fn wrap_slice(bytes: &[u8], offset: usize, capacity: usize) -> Result<Self> {
        let end = offset
            .checked_add(capacity)
            .ok_or(TesseraError::Invalid("slice range overflow"))?;
        let window = bytes
            .get(offset..end)
            .ok_or(TesseraError::Invalid("slice range beyond buffer"))?;
        Self::wrap(window.to_vec())
    }

    /// Total buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes available between the entry region and the offset table.
    pub fn free_space(&self) -> usize {
        self.buf.len() - HEADER_LEN - self.free_offset - self.count * SLOT_LEN
    }

    /// Bytes occupied by the header, entries and offset table.
    pub fn used_space(&self) -> usize {
        self.buf.len() - self.free_space()
    }

    /// Structural modification counter.
    pub fn modifications(&self) -> u64 {
        self.mods
    }

    /// Serialized form of the map.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the map, returning its buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Returns true if an absent entry of these lengths would fit.
    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        self.count < MAX_ENTRIES && entry_footprint(key_len, value_len) <= self.free_space()
    }

    /// Entry at `idx` in key order.
    pub fn entry_at(&self, idx: usize) -> Result<EntryRef<'_>> {
        let (start, len) = self.extent(idx)?;
        let key_len = read_u16(&self.buf, start) as usize;
        let value_len = read_u16(&self.buf, start + 2) as usize;
        let key_start = start + ENTRY_HEADER_LEN;
        let value_start = key_start + key_len;
        debug_assert_eq!(len, ENTRY_HEADER_LEN + key_len + value_len);
        Ok(EntryRef {
            key: &self.buf[key_start..value_start],
            value: ValueRef {
                tag: self.buf[value_start],
                payload: &self.buf[value_start + 1..value_start + value_len],
            },
        })
    }

    /// Key at `idx` in key order.
    pub fn key_at(&self, idx: usize) -> Result<&[u8]> {
        let (start, _) = self.extent(idx)?;
        let key_len = read_u16(&self.buf, start) as usize;
        let key_start = start + ENTRY_HEADER_LEN;
        Ok(&self.buf[key_start..key_start + key_len])
    }

    /// Binary search: `Ok(index)` when present, otherwise `Err(insertion point)`.
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match compare_keys(self.key_at(mid)?, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of `key`, or `-(insertion_point) - 1` when absent.
    pub fn index_of(&self, key: &[u8]) -> Result<i32> {
        Ok(match self.search(key)? {
            Ok(idx) => idx as i32,
            Err(point) => -(point as i32) - 1,
        })
    }

    /// Looks up `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<EntryRef<'_>>> {
        match self.search(key)? {
            Ok(idx) => self.entry_at(idx).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Locates the greatest stored key `<=` `key`.
    pub fn nearest(&self, key: &[u8]) -> Result<Nearest> {
        Ok(match self.search(key)? {
            Ok(idx) => Nearest::Exact(idx),
            Err(0) => Nearest::Before,
            Err(point) if point == self.count => Nearest::Last(point - 1),
            Err(point) => Nearest::Near(point - 1),
        })
    }

    /// Inserts or replaces `key`.
    ///
    /// A same-length replacement overwrites the value in place. A replacement of
    /// a different length is performed as remove-then-insert and reports
    /// [`MapPut::NoSpace`] (leaving the old entry untouched) when the new entry
    /// would not fit even after the old one is gone.
    pub fn put(&mut self, key: &[u8], value: ValueRef<'_>) -> Result<MapPut> {
        check_lengths(key, &value)?;
        match self.search(key)? {
            Ok(idx) => {
                let (previous, old_len) = {
                    let existing = self.entry_at(idx)?;
                    (existing.value.to_value(), existing.value.marshalled_len())
                };
                if old_len == value.marshalled_len() {
                    self.overwrite_value_at(idx, value)?;
                    return Ok(MapPut::Replaced(previous));
                }
                let available = self.free_space() + entry_footprint(key.len(), old_len);
                if entry_footprint(key.len(), value.marshalled_len()) > available {
                    return Ok(MapPut::NoSpace);
                }
                self.remove_at(idx)?;
                self.insert_at(idx, key, value)?;
                Ok(MapPut::Replaced(previous))
            }
            Err(idx) => {
                if !self.fits(key.len(), value.marshalled_len()) {
                    return Ok(MapPut::NoSpace);
                }
                self.insert_at(idx, key, value)?;
                Ok(MapPut::Inserted)
            }
        }
    }

    /// Appends an entry whose key sorts after every stored key.
    pub fn append(&mut self, key: &[u8], value: ValueRef<'_>) -> Result<MapPut> {
        check_lengths(key, &value)?;
        if self.count > 0 && compare_keys(self.key_at(self.count - 1)?, key) != Ordering::Less {
            return Err(TesseraError::Invalid("append key out of order"));
        }
        if !self.fits(key.len(), value.marshalled_len()) {
            return Ok(MapPut::NoSpace);
        }
        self.insert_at(self.count, key, value)?;
        Ok(MapPut::Inserted)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Value>> {
        match self.search(key)? {
            Ok(idx) => self.remove_at(idx).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Removes the entry at `idx`, compacting the entry region and offset table.
    pub fn remove_at(&mut self, idx: usize) -> Result<Value> {
        let (start, len) = self.extent(idx)?;
        let previous = self.entry_at(idx)?.value.to_value();
        let capacity = self.buf.len();

        let data_end = HEADER_LEN + self.free_offset;
        self.buf.copy_within(start + len..data_end, start);
        self.buf[data_end - len..data_end].fill(0);
        self.free_offset -= len;

        let removed_offset = start - HEADER_LEN;
        for slot in 0..self.count {
            if slot == idx {
                continue;
            }
            let offset = self.offset_at(slot);
            if offset > removed_offset {
                self.set_offset_at(slot, offset - len);
            }
        }

        let table_start = capacity - self.count * SLOT_LEN;
        let slot_pos = capacity - (idx + 1) * SLOT_LEN;
        self.buf
            .copy_within(table_start..slot_pos, table_start + SLOT_LEN);
        self.buf[table_start..table_start + SLOT_LEN].fill(0);
        self.count -= 1;
        self.write_header();
        self.mods += 1;
        Ok(previous)
    }

    /// Overwrites the value at `idx` with one of identical marshalled length.
    ///
    /// This is not a structural change and leaves the modification counter alone.
    pub fn overwrite_value_at(&mut self, idx: usize, value: ValueRef<'_>) -> Result<()> {
        let (start, _) = self.extent(idx)?;
        let key_len = read_u16(&self.buf, start) as usize;
        let value_len = read_u16(&self.buf, start + 2) as usize;
        if value_len != value.marshalled_len() {
            return Err(TesseraError::Invalid("in-place overwrite changes value length"));
        }
        let value_start = start + ENTRY_HEADER_LEN + key_len;
        self.buf[value_start] = value.tag;
        self.buf[value_start + 1..value_start + value_len].copy_from_slice(value.payload);
        Ok(())
    }

    /// Lowest entry.
    pub fn first(&self) -> Result<Option<EntryRef<'_>>> {
        if self.count == 0 {
            return Ok(None);
        }
        self.entry_at(0).map(Some)
    }

    /// Highest entry.
    pub fn last(&self) -> Result<Option<EntryRef<'_>>> {
        if self.count == 0 {
            return Ok(None);
        }
        self.entry_at(self.count - 1).map(Some)
    }

    /// Removes and returns the lowest entry.
    pub fn remove_first(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        if self.count == 0 {
            return Ok(None);
        }
        let key = self.key_at(0)?.to_vec();
        let value = self.remove_at(0)?;
        Ok(Some((key, value)))
    }

    /// Removes and returns the highest entry.
    pub fn remove_last(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        if self.count == 0 {
            return Ok(None);
        }
        let idx = self.count - 1;
        let key = self.key_at(idx)?.to_vec();
        let value = self.remove_at(idx)?;
        Ok(Some((key, value)))
    }

    /// Iterates entries in ascending key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter { map: self, idx: 0 }
    }

    /// Detached cursor that fails fast if the map is structurally modified
    /// between steps.
    pub fn cursor(&self) -> MapCursor {
        MapCursor {
            next: 0,
            expected_mods: self.mods,
        }
    }

    /// Splits the entries at the midpoint into two fresh maps of
    /// `target_capacity` bytes each.
    pub fn split(&self, target_capacity: usize) -> Result<(SortedBlockMap, SortedBlockMap)> {
        let mid = self.count / 2;
        let mut left = SortedBlockMap::create(target_capacity)?;
        let mut right = SortedBlockMap::create(target_capacity)?;
        for idx in 0..self.count {
            let entry = self.entry_at(idx)?;
            let dest = if idx < mid { &mut left } else { &mut right };
            if dest.append(entry.key, entry.value)? == MapPut::NoSpace {
                return Err(TesseraError::Invalid("split target capacity too small"));
            }
        }
        Ok((left, right))
    }

    /// Copies every entry into a fresh map of `capacity` bytes.
    pub fn resized(&self, capacity: usize) -> Result<SortedBlockMap> {
        let mut out = SortedBlockMap::create(capacity)?;
        for entry in self.iter() {
            let entry = entry?;
            if out.append(entry.key, entry.value)? == MapPut::NoSpace {
                return Err(TesseraError::Invalid("resize target capacity too small"));
            }
        }
        Ok(out)
    }

    /// Validates the layout, returning a diagnostic on the first violation.
    pub fn integrity_check(&self) -> Option<String> {
        let capacity = self.buf.len();
        if read_u16(&self.buf, COUNT_OFFSET) as usize != self.count
            || read_u32(&self.buf, FREE_OFFSET) as usize != self.free_offset
        {
            return Some("header disagrees with in-memory bookkeeping".into());
        }
        if self.count > max_entries_for(capacity) {
            return Some(format!(
                "entry count {} exceeds maximum {} for capacity {}",
                self.count,
                max_entries_for(capacity),
                capacity
            ));
        }
        let data_end = HEADER_LEN + self.free_offset;
        let table_start = match capacity.checked_sub(self.count * SLOT_LEN) {
            Some(start) if start >= data_end => start,
            _ => {
                return Some(format!(
                    "free offset {} overlaps offset table of {} slots",
                    self.free_offset, self.count
                ))
            }
        };
        if let Some(pos) = self.buf[data_end..table_start].iter().position(|&b| b != 0) {
            return Some(format!("free space not zeroed at byte {}", data_end + pos));
        }
        let mut extents = Vec::with_capacity(self.count);
        for idx in 0..self.count {
            match self.extent(idx) {
                Ok(extent) => extents.push(extent),
                Err(err) => return Some(format!("entry {idx}: {err}")),
            }
        }
        let total: usize = extents.iter().map(|(_, len)| len).sum();
        if total != self.free_offset {
            return Some(format!(
                "entries occupy {} bytes but free offset is {}",
                total, self.free_offset
            ));
        }
        let mut ordered = extents.clone();
        ordered.sort_unstable();
        let mut prev_end = HEADER_LEN;
        for (start, len) in ordered {
            if start < prev_end {
                return Some(format!("entry at byte {start} overlaps its predecessor"));
            }
            prev_end = start + len;
        }
        for idx in 1..self.count {
            let (prev, cur) = match (self.key_at(idx - 1), self.key_at(idx)) {
                (Ok(prev), Ok(cur)) => (prev, cur),
                _ => return Some(format!("entry {idx}: unreadable key")),
            };
            if compare_keys(prev, cur) != Ordering::Less {
                return Some(format!("keys not strictly ascending at index {idx}"));
            }
        }
        None
    }

    fn insert_at(&mut self, idx: usize, key: &[u8], value: ValueRef<'_>) -> Result<()> {
        debug_assert!(idx <= self.count);
        let capacity = self.buf.len();
        let entry_len = ENTRY_HEADER_LEN + key.len() + value.marshalled_len();
        let offset = self.free_offset;
        let start = HEADER_LEN + offset;
        write_u16(&mut self.buf, start, key.len() as u16);
        write_u16(&mut self.buf, start + 2, value.marshalled_len() as u16);
        let key_start = start + ENTRY_HEADER_LEN;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        let value_start = key_start + key.len();
        self.buf[value_start] = value.tag;
        self.buf[value_start + 1..value_start + value.marshalled_len()]
            .copy_from_slice(value.payload);
        self.free_offset += entry_len;

        let table_start = capacity - self.count * SLOT_LEN;
        let insert_end = capacity - idx * SLOT_LEN;
        self.buf
            .copy_within(table_start..insert_end, table_start - SLOT_LEN);
        self.count += 1;
        let offset = u32::try_from(offset)
            .map_err(|_| TesseraError::Invalid("entry offset exceeds u32"))?;
        self.set_offset_at(idx, offset as usize);
        self.write_header();
        self.mods += 1;
        Ok(())
    }

    /// Absolute start and length of the entry at `idx`, bounds-checked.
    fn extent(&self, idx: usize) -> Result<(usize, usize)> {
        if idx >= self.count {
            return Err(TesseraError::Invalid("entry index out of range"));
        }
        let data_end = HEADER_LEN + self.free_offset;
        let start = HEADER_LEN + self.offset_at(idx);
        if start + ENTRY_HEADER_LEN > data_end {
            return Err(TesseraError::Corruption("entry offset beyond free offset"));
        }
        let key_len = read_u16(&self.buf, start) as usize;
        let value_len = read_u16(&self.buf, start + 2) as usize;
        if value_len == 0 {
            return Err(TesseraError::Corruption("entry value missing type tag"));
        }
        let len = ENTRY_HEADER_LEN + key_len + value_len;
        if start + len > data_end {
            return Err(TesseraError::Corruption("entry extends past free offset"));
        }
        Ok((start, len))
    }

    fn offset_at(&self, idx: usize) -> usize {
        read_u32(&self.buf, self.buf.len() - (idx + 1) * SLOT_LEN) as usize
    }

    fn set_offset_at(&mut self, idx: usize, offset: usize) {
        let pos = self.buf.len() - (idx + 1) * SLOT_LEN;
        write_u32(&mut self.buf, pos, offset as u32);
    }

    fn write_header(&mut self) {
        let count = self.count as u16;
        let free = self.free_offset as u32;
        write_u16(&mut self.buf, COUNT_OFFSET, count);
        write_u32(&mut self.buf, FREE_OFFSET, free);
    }
}

/// Borrowing iterator over a map's entries.
pub struct Iter<'a> {
    map: &'a SortedBlockMap,
    idx: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<EntryRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.map.count {
            return None;
        }
        let item = self.map.entry_at(self.idx);
        self.idx += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.map.count - self.idx;
        (remaining, Some(remaining))
    }
}

/// Position in a map that survives across mutable borrows and detects
/// structural changes made in between.
#[derive(Clone, Debug)]
pub struct MapCursor {
    next: usize,
    expected_mods: u64,
}

impl MapCursor {
    /// Yields the next entry or fails if `map` changed since the cursor was made.
    pub fn next<'a>(&mut self, map: &'a SortedBlockMap) -> Result<Option<EntryRef<'a>>> {
        if map.mods != self.expected_mods {
            return Err(TesseraError::ConcurrentModification);
        }
        if self.next >= map.count {
            return Ok(None);
        }
        let entry = map.entry_at(self.next)?;
        self.next += 1;
        Ok(Some(entry))
    }
}

fn check_lengths(key: &[u8], value: &ValueRef<'_>) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(TesseraError::Invalid("key longer than 65535 bytes"));
    }
    if value.marshalled_len() > MAX_VALUE_LEN {
        return Err(TesseraError::Invalid("value longer than 65535 bytes"));
    }
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
