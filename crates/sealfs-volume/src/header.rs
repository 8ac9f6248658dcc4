//! Per-file header: the first [`HEADER_LEN`] bytes of every backing file.
//!
//! ```text
//! [u16 BE version][u8 flags][5 reserved, zero][16-byte stored seed]
//! ```
//!
//! Flags: bit 0 = block MAC, bit 1 = path-bound seed. Under a path-bound IV
//! policy the stored seed is `seed XOR mask(parent context, name)`, so the
//! same backing bytes reached through a different name yield a different
//! (wrong) seed.

use std::fs::File;
use std::os::unix::fs::FileExt;

use rand::RngCore;
use sealfs_core::{IntegrityMode, IvPolicy, SealfsError, SealfsResult};
use sealfs_crypto::{mac, DirContext, SEED_SIZE};

use crate::io::read_full_at;

pub const HEADER_LEN: usize = 24;
pub const HEADER_VERSION: u16 = 1;

const FLAG_BLOCK_MAC: u8 = 0b01;
const FLAG_PATH_BOUND: u8 = 0b10;
const RESERVED: std::ops::Range<usize> = 3..8;
const SEED_OFFSET: u64 = 8;

/// Mask XORed into the stored seed under [`IvPolicy::PathBound`]
pub type SeedMask = [u8; SEED_SIZE];

/// The decoded, unmasked header of one file.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub seed: [u8; SEED_SIZE],
}

impl std::fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHeader").finish_non_exhaustive()
    }
}

/// Derive the seed mask binding a file to `(parent context, name)`.
pub fn binding_mask(binding_key: &[u8; 32], parent: &DirContext, name: &str) -> SeedMask {
    let mut data = Vec::with_capacity(16 + parent.as_bytes().len() + name.len());
    data.extend_from_slice(b"sealfs-binding\0");
    data.extend_from_slice(parent.as_bytes());
    data.extend_from_slice(name.as_bytes());
    mac(binding_key, &data)
}

/// Header layout expectations of one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFormat {
    pub integrity: IntegrityMode,
    pub iv_policy: IvPolicy,
}

impl HeaderFormat {
    fn flags(self) -> u8 {
        let mut flags = 0;
        if self.integrity == IntegrityMode::BlockMac {
            flags |= FLAG_BLOCK_MAC;
        }
        if self.iv_policy == IvPolicy::PathBound {
            flags |= FLAG_PATH_BOUND;
        }
        flags
    }

    fn check_mask(self, mask: Option<&SeedMask>) -> SealfsResult<()> {
        match (self.iv_policy, mask) {
            (IvPolicy::Header, None) | (IvPolicy::PathBound, Some(_)) => Ok(()),
            (policy, _) => Err(SealfsError::Crypto(format!(
                "seed mask does not match IV policy {policy:?}"
            ))),
        }
    }

    /// Write a fresh header with a random seed at offset 0.
    pub fn create_header(self, file: &File, mask: Option<&SeedMask>) -> SealfsResult<FileHeader> {
        self.check_mask(mask)?;
        let mut seed = [0u8; SEED_SIZE];
        rand::thread_rng().fill_bytes(&mut seed);

        let mut raw = [0u8; HEADER_LEN];
        raw[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        raw[2] = self.flags();
        raw[SEED_OFFSET as usize..].copy_from_slice(&apply_mask(&seed, mask));
        file.write_all_at(&raw, 0)?;
        Ok(FileHeader { seed })
    }

    /// Read and validate the header, unmasking the seed.
    pub fn read_header(self, file: &File, mask: Option<&SeedMask>) -> SealfsResult<FileHeader> {
        self.check_mask(mask)?;
        let stored = self.read_stored(file)?;
        Ok(FileHeader {
            seed: apply_mask(&stored, mask),
        })
    }

    /// Re-encode the stored seed for a new `(parent, name)` binding.
    ///
    /// The real seed, and so every content block, is left unchanged.
    pub fn rebind(self, file: &File, old: &SeedMask, new: &SeedMask) -> SealfsResult<()> {
        self.check_mask(Some(old))?;
        let stored = self.read_stored(file)?;
        let seed = apply_mask(&stored, Some(old));
        file.write_all_at(&apply_mask(&seed, Some(new)), SEED_OFFSET)?;
        Ok(())
    }

    fn read_stored(self, file: &File) -> SealfsResult<[u8; SEED_SIZE]> {
        let mut raw = [0u8; HEADER_LEN];
        let n = read_full_at(file, &mut raw, 0)?;
        if n < HEADER_LEN {
            return Err(SealfsError::CorruptHeader(format!(
                "header is {n} bytes, expected {HEADER_LEN}"
            )));
        }

        let version = u16::from_be_bytes([raw[0], raw[1]]);
        if version != HEADER_VERSION {
            return Err(SealfsError::CorruptHeader(format!("unknown header version {version}")));
        }
        if raw[RESERVED].iter().any(|&b| b != 0) {
            return Err(SealfsError::CorruptHeader("reserved bytes are not zero".into()));
        }
        if raw[2] != self.flags() {
            return Err(SealfsError::CorruptHeader(format!(
                "flags {:#04x} disagree with volume ({:#04x})",
                raw[2],
                self.flags()
            )));
        }

        let mut stored = [0u8; SEED_SIZE];
        stored.copy_from_slice(&raw[SEED_OFFSET as usize..]);
        Ok(stored)
    }
}

fn apply_mask(seed: &[u8; SEED_SIZE], mask: Option<&SeedMask>) -> [u8; SEED_SIZE] {
    let mut out = *seed;
    if let Some(mask) = mask {
        out.iter_mut().zip(mask).for_each(|(b, m)| *b ^= m);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    const STANDARD: HeaderFormat = HeaderFormat {
        integrity: IntegrityMode::None,
        iv_policy: IvPolicy::Header,
    };
    const PARANOID: HeaderFormat = HeaderFormat {
        integrity: IntegrityMode::BlockMac,
        iv_policy: IvPolicy::PathBound,
    };

    #[test]
    fn test_create_then_read() {
        let f = tempfile().unwrap();
        let created = STANDARD.create_header(&f, None).unwrap();
        assert_eq!(f.metadata().unwrap().len(), HEADER_LEN as u64);
        assert_eq!(STANDARD.read_header(&f, None).unwrap(), created);
    }

    #[test]
    fn test_seeds_are_random() {
        let a = STANDARD.create_header(&tempfile().unwrap(), None).unwrap();
        let b = STANDARD.create_header(&tempfile().unwrap(), None).unwrap();
        assert_ne!(a.seed, b.seed);
    }

    #[test]
    fn test_short_header_is_corrupt() {
        let f = tempfile().unwrap();
        assert!(matches!(
            STANDARD.read_header(&f, None),
            Err(SealfsError::CorruptHeader(_))
        ));
        f.write_all_at(&[0, 1, 0], 0).unwrap();
        assert!(matches!(
            STANDARD.read_header(&f, None),
            Err(SealfsError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_unknown_version_and_reserved_bytes() {
        let f = tempfile().unwrap();
        STANDARD.create_header(&f, None).unwrap();
        f.write_all_at(&[0, 9], 0).unwrap();
        assert!(matches!(STANDARD.read_header(&f, None), Err(SealfsError::CorruptHeader(_))));

        let f = tempfile().unwrap();
        STANDARD.create_header(&f, None).unwrap();
        f.write_all_at(&[1], 5).unwrap();
        assert!(matches!(STANDARD.read_header(&f, None), Err(SealfsError::CorruptHeader(_))));
    }

    #[test]
    fn test_flag_mismatch() {
        let f = tempfile().unwrap();
        STANDARD.create_header(&f, None).unwrap();
        let mac_only = HeaderFormat {
            integrity: IntegrityMode::BlockMac,
            iv_policy: IvPolicy::Header,
        };
        assert!(matches!(mac_only.read_header(&f, None), Err(SealfsError::CorruptHeader(_))));
    }

    #[test]
    fn test_path_bound_mask_and_rebind() {
        let key = [7u8; 32];
        let ctx = DirContext::from_bytes([1u8; 16]);
        let old = binding_mask(&key, &ctx, "a.txt");
        let new = binding_mask(&key, &ctx, "b.txt");
        assert_ne!(old, new);

        let f = tempfile().unwrap();
        let created = PARANOID.create_header(&f, Some(&old)).unwrap();
        assert_eq!(PARANOID.read_header(&f, Some(&old)).unwrap(), created);
        // wrong binding yields a different seed, not an error
        assert_ne!(PARANOID.read_header(&f, Some(&new)).unwrap(), created);

        PARANOID.rebind(&f, &old, &new).unwrap();
        assert_eq!(PARANOID.read_header(&f, Some(&new)).unwrap(), created);
    }

    #[test]
    fn test_mask_required_for_path_bound() {
        let f = tempfile().unwrap();
        assert!(PARANOID.create_header(&f, None).is_err());
        assert!(STANDARD.create_header(&f, Some(&[0u8; 16])).is_err());
    }
}
