//! Binary (de)serialization of [`CacheEntry`] metadata.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! [u32 key length][key, UTF-8][u64 size][u32 availability length][availability bitmap]
//! ```
//!
//! The bitmap holds one bit per block, block `i` being bit `i % 8` of byte `i / 8`. Its length is
//! always exactly `ceil(block_count / 8)` and no bit past the last block is set. Loading rejects
//! anything else, which makes persisting a loaded entry reproduce the input byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rangemap::RangeSet;

use crate::{entry::CacheEntry, error::FormatError};

#[derive(Debug, Clone, Copy)]
pub struct CacheEntryPersister {
    block_size: u64,
}

impl CacheEntryPersister {
    pub fn new(block_size: u64) -> Self {
        Self { block_size }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Serializes the metadata of the entry. The availability is taken as a snapshot, so
    /// concurrent writes to the entry never produce a torn bitmap.
    #[allow(clippy::cast_possible_truncation)]
    pub fn persist(&self, entry: &CacheEntry) -> Bytes {
        let key = entry.key().as_bytes();
        let bitmap = encode_bitmap(&entry.available_snapshot(), entry.block_count());

        let mut out = BytesMut::with_capacity(4 + key.len() + 8 + 4 + bitmap.len());
        out.put_u32(key.len() as u32);
        out.put_slice(key);
        out.put_u64(entry.size());
        out.put_u32(bitmap.len() as u32);
        out.put_slice(&bitmap);

        out.freeze()
    }

    /// Reconstructs an entry from its serialized metadata.
    pub fn load(&self, bytes: &[u8]) -> Result<CacheEntry, FormatError> {
        let mut buf = bytes;

        let key_len = take_len(&mut buf, "key length")?;
        ensure_remaining(buf, key_len, "key")?;
        let key = String::from_utf8(buf[..key_len].to_vec()).map_err(FormatError::Key)?;
        buf.advance(key_len);

        ensure_remaining(buf, 8, "size")?;
        let size = buf.get_u64();

        let block_count = size.div_ceil(self.block_size);
        let expected = bitmap_len(block_count);
        let actual = take_len(&mut buf, "availability length")?;

        if Some(actual) != expected {
            return Err(FormatError::AvailabilityLength {
                size,
                expected: expected.unwrap_or(usize::MAX),
                actual,
            });
        }

        ensure_remaining(buf, actual, "availability")?;
        let blocks = decode_bitmap(&buf[..actual], block_count)?;
        buf.advance(actual);

        if buf.has_remaining() {
            return Err(FormatError::TrailingBytes(buf.remaining()));
        }

        // The bitmap was validated against the block count above, so this cannot fail.
        CacheEntry::with_available(key, size, self.block_size, blocks).map_err(|_| {
            FormatError::AvailabilityOverflow {
                block: block_count,
                block_count,
            }
        })
    }
}

fn bitmap_len(block_count: u64) -> Option<usize> {
    usize::try_from(block_count.div_ceil(8)).ok()
}

#[allow(clippy::cast_possible_truncation)]
fn encode_bitmap(blocks: &RangeSet<u64>, block_count: u64) -> Vec<u8> {
    let mut bitmap = vec![0u8; bitmap_len(block_count).unwrap_or_default()];

    for block in blocks.iter().flat_map(Clone::clone) {
        bitmap[(block / 8) as usize] |= 1 << (block % 8);
    }

    bitmap
}

fn decode_bitmap(bitmap: &[u8], block_count: u64) -> Result<RangeSet<u64>, FormatError> {
    let mut blocks = RangeSet::new();
    let mut run_start = None;
    let mut block = 0;

    for byte in bitmap {
        for bit in 0..8 {
            let set = byte & (1 << bit) != 0;

            match (set, run_start) {
                (true, _) if block >= block_count => {
                    return Err(FormatError::AvailabilityOverflow { block, block_count });
                }
                (true, None) => run_start = Some(block),
                (false, Some(start)) => {
                    blocks.insert(start..block);
                    run_start = None;
                }
                _ => (),
            }

            block += 1;
        }
    }

    if let Some(start) = run_start {
        blocks.insert(start..block);
    }

    Ok(blocks)
}

fn take_len(buf: &mut &[u8], field: &'static str) -> Result<usize, FormatError> {
    ensure_remaining(buf, 4, field)?;
    // A u32 always fits into usize on the platforms we support.
    Ok(buf.get_u32() as usize)
}

fn ensure_remaining(buf: &[u8], len: usize, field: &'static str) -> Result<(), FormatError> {
    match len.checked_sub(buf.len()) {
        Some(needed) if needed > 0 => Err(FormatError::Truncated { field, needed }),
        _ => Ok(()),
    }
}
