//! Control record: the per-volume parameter file at the backing root.
//!
//! Written once by `init` and read on every mount. It carries everything
//! needed to rebuild the key hierarchy except the passphrase itself.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sealfs_core::config::{KdfConfig, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use sealfs_core::{IntegrityMode, IvPolicy, NameContextMode, Profile, SealfsError, SealfsResult};
use sealfs_crypto::{CIPHER_ID, SALT_SIZE, TAG_SIZE, WRAPPED_KEY_SIZE};

/// File name of the control record at the backing root
pub const CONTROL_FILE: &str = ".sealfs.toml";

/// File name of a directory's name context
pub const DIRIV_FILE: &str = ".sealfs.diriv";

/// Backing entries with this prefix belong to the engine, never to the user
pub const RESERVED_PREFIX: &str = ".sealfs.";

pub const FORMAT_VERSION: u32 = 1;

/// Persisted volume parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub version: u32,
    pub cipher: String,
    pub profile: Profile,
    pub block_size: u32,
    pub integrity: IntegrityMode,
    pub iv_policy: IvPolicy,
    pub name_context: NameContextMode,
    pub encrypt_symlinks: bool,
    pub allow_holes: bool,
    /// Argon2id salt (base64)
    pub salt: String,
    /// Volume key wrapped under the passphrase KEK (base64)
    pub wrapped_key: String,
    /// Keyed fingerprint of the volume key (base64)
    pub key_check: String,
    /// Creation time, seconds since the Unix epoch
    pub created: u64,
    pub kdf: KdfConfig,
}

impl ControlRecord {
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONTROL_FILE)
    }

    pub fn exists(root: &Path) -> bool {
        Self::path(root).is_file()
    }

    /// Read and validate the record of the volume at `root`.
    pub fn load(root: &Path) -> SealfsResult<Self> {
        let path = Self::path(root);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SealfsError::NotInitialized(root.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let record: ControlRecord = toml::from_str(&content)
            .map_err(|e| SealfsError::Config(format!("parsing {}: {e}", path.display())))?;
        record.validate()?;
        debug!(path = %path.display(), "loaded control record");
        Ok(record)
    }

    /// Persist a new record. Fails if the volume is already initialized.
    ///
    /// Written to a temp file and renamed into place.
    pub fn store_new(&self, root: &Path) -> SealfsResult<()> {
        self.validate()?;
        let path = Self::path(root);
        if path.exists() {
            return Err(SealfsError::AlreadyInitialized(root.display().to_string()));
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SealfsError::Config(format!("serializing control record: {e}")))?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "wrote control record");
        Ok(())
    }

    pub fn validate(&self) -> SealfsResult<()> {
        if self.version != FORMAT_VERSION {
            return Err(SealfsError::Config(format!(
                "unsupported control record version {} (expected {FORMAT_VERSION})",
                self.version
            )));
        }
        if self.cipher != CIPHER_ID {
            return Err(SealfsError::Config(format!(
                "unsupported cipher '{}' (expected '{CIPHER_ID}')",
                self.cipher
            )));
        }
        check_block_size(self.block_size)?;
        self.salt_bytes()?;
        self.wrapped_key_bytes()?;
        self.key_check_bytes()?;
        Ok(())
    }

    pub fn salt_bytes(&self) -> SealfsResult<[u8; SALT_SIZE]> {
        decode_fixed("salt", &self.salt)
    }

    pub fn wrapped_key_bytes(&self) -> SealfsResult<[u8; WRAPPED_KEY_SIZE]> {
        decode_fixed("wrapped_key", &self.wrapped_key)
    }

    pub fn key_check_bytes(&self) -> SealfsResult<[u8; TAG_SIZE]> {
        decode_fixed("key_check", &self.key_check)
    }

    /// Bytes of authentication tag stored after each block
    pub fn tag_size(&self) -> u64 {
        match self.integrity {
            IntegrityMode::None => 0,
            IntegrityMode::BlockMac => TAG_SIZE as u64,
        }
    }

    /// Sparse growth is only sound when blocks carry no tag.
    pub fn holes_enabled(&self) -> bool {
        self.allow_holes && self.integrity == IntegrityMode::None
    }
}

pub fn check_block_size(block_size: u32) -> SealfsResult<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(SealfsError::Config(format!(
            "block size {block_size} outside {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode_fixed<const N: usize>(field: &str, value: &str) -> SealfsResult<[u8; N]> {
    let raw = STANDARD
        .decode(value)
        .map_err(|e| SealfsError::Config(format!("control record field {field}: {e}")))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        SealfsError::Config(format!(
            "control record field {field}: {} bytes (expected {N})",
            raw.len()
        ))
    })
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ControlRecord {
        ControlRecord {
            version: FORMAT_VERSION,
            cipher: CIPHER_ID.into(),
            profile: Profile::Paranoid,
            block_size: 1024,
            integrity: IntegrityMode::BlockMac,
            iv_policy: IvPolicy::PathBound,
            name_context: NameContextMode::PerDirectory,
            encrypt_symlinks: true,
            allow_holes: true,
            salt: encode_b64(&[1u8; SALT_SIZE]),
            wrapped_key: encode_b64(&[2u8; WRAPPED_KEY_SIZE]),
            key_check: encode_b64(&[3u8; TAG_SIZE]),
            created: 1_700_000_000,
            kdf: KdfConfig::default(),
        }
    }

    #[test]
    fn test_store_and_load() {
        let tmp = TempDir::new().unwrap();
        let record = sample();
        record.store_new(tmp.path()).unwrap();

        let loaded = ControlRecord::load(tmp.path()).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.salt_bytes().unwrap(), [1u8; SALT_SIZE]);
        assert!(!tmp.path().join(".sealfs.toml.tmp").exists());
    }

    #[test]
    fn test_store_twice_fails() {
        let tmp = TempDir::new().unwrap();
        sample().store_new(tmp.path()).unwrap();
        let result = sample().store_new(tmp.path());
        assert!(matches!(result, Err(SealfsError::AlreadyInitialized(_))));
    }

    #[test]
    fn test_missing_record() {
        let tmp = TempDir::new().unwrap();
        let result = ControlRecord::load(tmp.path());
        assert!(matches!(result, Err(SealfsError::NotInitialized(_))));
    }

    #[test]
    fn test_corrupt_record() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(ControlRecord::path(tmp.path()), "version = [not toml").unwrap();
        assert!(matches!(ControlRecord::load(tmp.path()), Err(SealfsError::Config(_))));
    }

    #[test]
    fn test_validation() {
        let mut bad = sample();
        bad.cipher = "rot13".into();
        assert!(bad.validate().is_err());

        let mut bad = sample();
        bad.block_size = 7;
        assert!(bad.validate().is_err());

        let mut bad = sample();
        bad.salt = encode_b64(&[0u8; 4]);
        assert!(matches!(bad.validate(), Err(SealfsError::Config(_))));
    }

    #[test]
    fn test_tag_size_and_holes() {
        let mut record = sample();
        assert_eq!(record.tag_size(), TAG_SIZE as u64);
        assert!(!record.holes_enabled());
        record.integrity = IntegrityMode::None;
        assert_eq!(record.tag_size(), 0);
        assert!(record.holes_enabled());
    }
}
