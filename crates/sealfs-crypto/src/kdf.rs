//! Key derivation: Argon2id passphrase → key-encryption key

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sealfs_core::config::KdfConfig;
use sealfs_core::{SealfsError, SealfsResult};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit key derived from the passphrase. Only ever used to wrap and
/// unwrap the volume key.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct KeyEncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl KeyEncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for KeyEncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfConfig::default().into()
    }
}

impl From<KdfConfig> for KdfParams {
    fn from(c: KdfConfig) -> Self {
        Self {
            mem_cost_kib: c.mem_cost_kib,
            time_cost: c.time_cost,
            parallelism: c.parallelism,
        }
    }
}

/// Generate a random Argon2id salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive the key-encryption key from a passphrase and salt using Argon2id.
///
/// The salt is stored in the control record; it does not need to be secret.
pub fn derive_kek(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> SealfsResult<KeyEncryptionKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| SealfsError::Config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| SealfsError::Crypto(format!("Argon2id KDF failed: {e}")))?;

    Ok(KeyEncryptionKey::from_bytes(key))
}
