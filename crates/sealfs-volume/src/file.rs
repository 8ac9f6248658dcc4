//! Block encryption engine over one open backing file.
//!
//! Every read and write is split into the blocks it touches. A partial
//! block write is a read-modify-write: decrypt (and verify) the stored
//! block, merge, re-encrypt, re-tag, write back, all under that block's lock.

use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::sync::Arc;

use tracing::{debug, warn};

use sealfs_core::{IntegrityMode, SealfsError, SealfsResult};
use sealfs_crypto::{block_iv, block_tag, decrypt_block, encrypt_block, verify_tag, FileKey, TAG_SIZE};

use crate::header::FileHeader;
use crate::io::read_full_at;
use crate::locks::FileId;
use crate::volume::{MountedKeys, Session};

/// Lock-table slot serializing size changes of one file. Offsets are capped
/// at `i64::MAX`, so no block index reaches it.
const RESIZE_SLOT: u64 = u64::MAX;

/// An open encrypted file. `Send + Sync`; all I/O is positional.
pub struct CryptFile {
    session: Arc<Session>,
    backing: File,
    id: FileId,
    header: FileHeader,
    path: String,
    writable: bool,
}

impl std::fmt::Debug for CryptFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptFile")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("writable", &self.writable)
            .finish()
    }
}

impl CryptFile {
    pub(crate) fn new(
        session: Arc<Session>,
        backing: File,
        header: FileHeader,
        path: String,
        writable: bool,
    ) -> SealfsResult<Self> {
        let meta = backing.metadata()?;
        Ok(Self {
            session,
            backing,
            id: (meta.dev(), meta.ino()),
            header,
            path,
            writable,
        })
    }

    /// Plaintext path this file was opened through
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Logical (plaintext) size in bytes.
    pub fn size(&self) -> SealfsResult<u64> {
        self.session.with_keys(|_| self.logical_size())
    }

    /// Read up to `len` bytes at `offset`. Short at EOF, empty past it.
    pub fn read_at(&self, offset: u64, len: usize) -> SealfsResult<Vec<u8>> {
        self.session.with_keys(|keys| {
            let size = self.logical_size()?;
            if offset >= size || len == 0 {
                return Ok(Vec::new());
            }
            let end = size.min(offset.saturating_add(len as u64));
            let file_key = keys.keys.derive_file_subkey(&self.header.seed)?;
            let layout = self.session.layout;

            let mut out = Vec::with_capacity((end - offset) as usize);
            for index in layout.block_index(offset)..=layout.block_index(end - 1) {
                let plain = {
                    let _guard = self.session.locks.lock(self.id, index);
                    let raw = self.read_block(index)?;
                    self.decode_block(keys, &file_key, index, raw)?
                };
                let start = index * layout.block_size;
                let from = (offset.max(start) - start) as usize;
                let to = ((end - start) as usize).min(plain.len());
                if from >= to {
                    break;
                }
                out.extend_from_slice(&plain[from..to]);
            }
            debug!(path = %self.path, offset, len = out.len(), "read");
            Ok(out)
        })
    }

    /// Read the whole file.
    pub fn read_to_end(&self) -> SealfsResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> SealfsResult<usize> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset.checked_add(data.len() as u64).ok_or_else(file_too_large)?;
        self.check_extent(end)?;

        self.session.with_keys(|keys| {
            let file_key = keys.keys.derive_file_subkey(&self.header.seed)?;
            if offset > self.logical_size()? {
                let _resize = self.session.locks.lock(self.id, RESIZE_SLOT);
                self.extend_to(keys, &file_key, offset)?;
            }

            let layout = self.session.layout;
            let block_size = layout.block_size as usize;
            let mut pos = offset;
            let mut rest = data;
            while !rest.is_empty() {
                let index = layout.block_index(pos);
                let within = (pos % layout.block_size) as usize;
                let n = rest.len().min(block_size - within);
                let (chunk, tail) = rest.split_at(n);

                if n == block_size {
                    let _guard = self.session.locks.lock(self.id, index);
                    self.store_block(keys, &file_key, index, chunk)?;
                } else {
                    self.modify_block(keys, &file_key, index, |plain| {
                        if plain.len() < within + n {
                            plain.resize(within + n, 0);
                        }
                        plain[within..within + n].copy_from_slice(chunk);
                    })?;
                }

                pos += n as u64;
                rest = tail;
            }
            debug!(path = %self.path, offset, len = data.len(), "wrote");
            Ok(data.len())
        })
    }

    /// Set the logical size. Growth reads back as zeros.
    pub fn truncate(&self, new_size: u64) -> SealfsResult<()> {
        self.check_writable()?;
        self.check_extent(new_size)?;
        self.session.with_keys(|keys| {
            let file_key = keys.keys.derive_file_subkey(&self.header.seed)?;
            let _resize = self.session.locks.lock(self.id, RESIZE_SLOT);
            let size = self.logical_size()?;
            let layout = self.session.layout;

            if new_size > size {
                self.extend_to(keys, &file_key, new_size)?;
            } else if new_size < size {
                let rem = (new_size % layout.block_size) as usize;
                if rem == 0 {
                    self.backing.set_len(layout.physical_len(new_size))?;
                } else {
                    // the new last block is re-encrypted and re-tagged
                    let index = layout.block_index(new_size);
                    let _guard = self.session.locks.lock(self.id, index);
                    let raw = self.read_block(index)?;
                    let mut plain = self.decode_block(keys, &file_key, index, raw)?;
                    plain.truncate(rem);
                    self.store_block(keys, &file_key, index, &plain)?;
                    self.backing.set_len(layout.physical_len(new_size))?;
                }
            }
            debug!(path = %self.path, from = size, to = new_size, "truncated");
            Ok(())
        })
    }

    /// Flush data and metadata to the backing store.
    pub fn sync(&self) -> SealfsResult<()> {
        self.session.with_keys(|_| Ok(self.backing.sync_all()?))
    }

    fn check_writable(&self) -> SealfsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(SealfsError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is open read-only", self.path),
            )))
        }
    }

    fn logical_size(&self) -> SealfsResult<u64> {
        let physical = self.backing.metadata()?.len();
        self.session.layout.logical_len(physical).ok_or_else(|| {
            SealfsError::CorruptHeader(format!("{}: backing file shorter than header", self.path))
        })
    }

    /// Offsets and backing lengths must fit in `off_t`.
    fn check_extent(&self, end: u64) -> SealfsResult<()> {
        let limit = i64::MAX as u64;
        if end > limit || self.session.layout.physical_len(end) > limit {
            return Err(file_too_large());
        }
        Ok(())
    }

    /// Zero-fill from the current end to `new`. Caller holds the resize slot.
    ///
    /// Appends at the current end do not take the resize slot, so the end is
    /// re-read on every step and blocks are only ever lengthened.
    fn extend_to(&self, keys: &MountedKeys, file_key: &FileKey, new: u64) -> SealfsResult<()> {
        let layout = self.session.layout;
        loop {
            let size = self.logical_size()?;
            if size >= new {
                return Ok(());
            }
            let index = layout.block_index(size);
            let block_start = index * layout.block_size;

            if size % layout.block_size != 0 {
                // a partial last block is completed before anything lies past it
                let len = (((index + 1) * layout.block_size).min(new) - block_start) as usize;
                self.modify_block(keys, file_key, index, |plain| grow_only(plain, len))?;
                continue;
            }

            if self.session.record.holes_enabled() {
                // an append must take this block before it can pass it
                let _guard = self.session.locks.lock(self.id, index);
                if self.logical_size()? == size {
                    self.backing.set_len(layout.physical_len(new))?;
                    return Ok(());
                }
                continue;
            }

            let len = (new - block_start).min(layout.block_size) as usize;
            self.modify_block(keys, file_key, index, |plain| grow_only(plain, len))?;
        }
    }

    /// Read-modify-write one block under its lock.
    fn modify_block(
        &self,
        keys: &MountedKeys,
        file_key: &FileKey,
        index: u64,
        edit: impl FnOnce(&mut Vec<u8>),
    ) -> SealfsResult<()> {
        let _guard = self.session.locks.lock(self.id, index);
        let raw = self.read_block(index)?;
        let mut plain = self.decode_block(keys, file_key, index, raw)?;
        edit(&mut plain);
        self.store_block(keys, file_key, index, &plain)
    }

    /// Encrypt and write one block. Caller holds the block lock.
    fn store_block(&self, keys: &MountedKeys, file_key: &FileKey, index: u64, plain: &[u8]) -> SealfsResult<()> {
        let iv = block_iv(file_key, index);
        let mut stored = encrypt_block(file_key, &iv, plain);
        if self.session.record.integrity == IntegrityMode::BlockMac {
            let tag = block_tag(keys.keys.block_mac_key(), &iv, &stored);
            stored.extend_from_slice(&tag);
        }
        self.backing
            .write_all_at(&stored, self.session.layout.block_offset(index))?;
        Ok(())
    }

    /// Raw stored bytes of block `index`, short or empty at EOF.
    fn read_block(&self, index: u64) -> SealfsResult<Vec<u8>> {
        let layout = self.session.layout;
        let mut raw = vec![0u8; layout.stored_block() as usize];
        let n = read_full_at(&self.backing, &mut raw, layout.block_offset(index))?;
        raw.truncate(n);
        Ok(raw)
    }

    fn decode_block(
        &self,
        keys: &MountedKeys,
        file_key: &FileKey,
        index: u64,
        raw: Vec<u8>,
    ) -> SealfsResult<Vec<u8>> {
        if raw.is_empty() {
            return Ok(raw);
        }
        let iv = block_iv(file_key, index);

        match self.session.record.integrity {
            IntegrityMode::BlockMac => {
                if raw.len() <= TAG_SIZE {
                    warn!(path = %self.path, block = index, len = raw.len(), "block too short for its tag");
                    return Err(SealfsError::Integrity { block: index });
                }
                let (ciphertext, tag) = raw.split_at(raw.len() - TAG_SIZE);
                let expected = block_tag(keys.keys.block_mac_key(), &iv, ciphertext);
                if !verify_tag(&expected, tag) {
                    warn!(path = %self.path, block = index, "block tag mismatch");
                    return Err(SealfsError::Integrity { block: index });
                }
                Ok(decrypt_block(file_key, &iv, ciphertext))
            }
            IntegrityMode::None => {
                // sparse region left by a hole-extending truncate
                if self.session.record.holes_enabled() && raw.iter().all(|&b| b == 0) {
                    return Ok(raw);
                }
                Ok(decrypt_block(file_key, &iv, &raw))
            }
        }
    }
}

fn grow_only(plain: &mut Vec<u8>, len: usize) {
    if plain.len() < len {
        plain.resize(len, 0);
    }
}

fn file_too_large() -> SealfsError {
    SealfsError::Io(io::Error::from_raw_os_error(libc::EFBIG))
}
