//! Per-(file, block) exclusive locks.
//!
//! Read-modify-write of a block must not interleave with another writer of
//! the same block. Files are identified by backing `(dev, ino)` so hard
//! links to one file share locks. Different blocks never contend.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Backing `(device, inode)` pair
pub type FileId = (u64, u64);

type BlockKey = (FileId, u64);

#[derive(Debug, Default)]
pub struct BlockLocks {
    held: Mutex<HashSet<BlockKey>>,
    released: Condvar,
}

/// Holds one block lock until dropped.
#[derive(Debug)]
pub struct BlockGuard<'a> {
    locks: &'a BlockLocks,
    key: BlockKey,
}

impl BlockLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `(file, index)` is free, then take it.
    pub fn lock(&self, file: FileId, index: u64) -> BlockGuard<'_> {
        let key = (file, index);
        let mut held = self.table();
        while held.contains(&key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key);
        BlockGuard { locks: self, key }
    }

    /// Number of blocks currently locked
    pub fn held(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashSet<BlockKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.locks.table().remove(&self.key);
        self.locks.released.notify_all();
    }
}
