//! Mapping between logical (plaintext) offsets and backing offsets.
//!
//! A backing file is `header || block_0 || block_1 || ...`, each block being
//! `block_size` bytes of ciphertext followed by `tag_size` bytes of tag. Only
//! the last block may be short.

use crate::header::HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u64,
    pub tag_size: u64,
}

impl BlockLayout {
    pub fn new(block_size: u32, tag_size: u64) -> Self {
        Self {
            block_size: u64::from(block_size),
            tag_size,
        }
    }

    /// Size of one full block on disk
    pub fn stored_block(&self) -> u64 {
        self.block_size + self.tag_size
    }

    /// Backing offset where block `index` starts
    pub fn block_offset(&self, index: u64) -> u64 {
        HEADER_LEN as u64 + index * self.stored_block()
    }

    pub fn block_index(&self, logical: u64) -> u64 {
        logical / self.block_size
    }

    /// Backing length of a file holding `logical` plaintext bytes
    pub fn physical_len(&self, logical: u64) -> u64 {
        let full = logical / self.block_size;
        let rem = logical % self.block_size;
        let tail = if rem > 0 { rem + self.tag_size } else { 0 };
        HEADER_LEN as u64 + full * self.stored_block() + tail
    }

    /// Logical length of a backing file of `physical` bytes, or `None` if it
    /// cannot even hold a header.
    ///
    /// With tags, a trailing fragment of at most `tag_size` bytes is still
    /// counted, so reading it reports an integrity failure instead of
    /// silently hiding appended bytes.
    pub fn logical_len(&self, physical: u64) -> Option<u64> {
        let body = physical.checked_sub(HEADER_LEN as u64)?;
        let full = body / self.stored_block();
        let rem = body % self.stored_block();
        let tail = if rem > self.tag_size { rem - self.tag_size } else { rem };
        Some(full * self.block_size + tail)
    }
}
