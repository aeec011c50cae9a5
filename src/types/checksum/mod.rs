#![forbid(unsafe_code)]

/// CRC32 over a block frame: the address and frame metadata are mixed in so a
/// block copied to the wrong place fails verification.
pub fn block_crc32(address: u64, kind: u8, level: u16, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&address.to_be_bytes());
    hasher.update(&[kind]);
    hasher.update(&level.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
