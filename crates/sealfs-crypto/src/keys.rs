//! Key hierarchy: volume key generation and wrapping, derived subkeys,
//! per-file subkeys

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sealfs_core::{SealfsError, SealfsResult};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroize;

use crate::cipher::{mac, Tag};
use crate::kdf::KeyEncryptionKey;
use crate::{AEAD_TAG_SIZE, KEY_SIZE, NONCE_SIZE, SEED_SIZE};

/// Length of a wrapped volume key: nonce || ciphertext || tag
pub const WRAPPED_KEY_SIZE: usize = NONCE_SIZE + KEY_SIZE + AEAD_TAG_SIZE;

macro_rules! secret_key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key_type!(
    /// The 256-bit master key of a volume. Only ever persisted wrapped.
    VolumeKey
);

secret_key_type!(
    /// A per-file content key derived from the volume content key and the
    /// file's IV seed. Zeroized on drop.
    FileKey
);

secret_key_type!(
    /// A domain-separated subkey of the volume key.
    SubKey
);

/// Generate a random 256-bit volume key.
pub fn generate_volume_key() -> VolumeKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    VolumeKey::from_bytes(bytes)
}

/// Every key a mounted volume needs, derived once at mount time.
#[derive(Debug)]
pub struct VolumeKeys {
    volume: VolumeKey,
    content: SubKey,
    block_mac: SubKey,
    names: SubKey,
    binding: SubKey,
}

impl VolumeKeys {
    pub fn derive(volume: VolumeKey) -> SealfsResult<Self> {
        let content = SubKey::from_bytes(hkdf_derive(volume.as_bytes(), None, b"sealfs-content")?);
        let block_mac = SubKey::from_bytes(hkdf_derive(volume.as_bytes(), None, b"sealfs-block-mac")?);
        let names = SubKey::from_bytes(hkdf_derive(volume.as_bytes(), None, b"sealfs-names")?);
        let binding = SubKey::from_bytes(hkdf_derive(volume.as_bytes(), None, b"sealfs-binding")?);
        debug!("derived volume subkeys");
        Ok(Self {
            volume,
            content,
            block_mac,
            names,
            binding,
        })
    }

    pub fn volume_key(&self) -> &VolumeKey {
        &self.volume
    }

    pub fn block_mac_key(&self) -> &[u8; KEY_SIZE] {
        self.block_mac.as_bytes()
    }

    pub fn name_key(&self) -> &[u8; KEY_SIZE] {
        self.names.as_bytes()
    }

    pub fn binding_key(&self) -> &[u8; KEY_SIZE] {
        self.binding.as_bytes()
    }

    /// Fingerprint kept in the control record so a raw or recovered key
    /// can be checked before any file is touched.
    pub fn key_check(&self) -> Tag {
        mac(self.volume.as_bytes(), b"sealfs-key-check")
    }

    /// Derive the content key for one file from its IV seed.
    ///
    /// Distinct seeds give independent keystreams under one volume key.
    pub fn derive_file_subkey(&self, seed: &[u8; SEED_SIZE]) -> SealfsResult<FileKey> {
        hkdf_derive(self.content.as_bytes(), Some(seed), b"sealfs-file").map(FileKey::from_bytes)
    }
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
fn hkdf_derive(ikm: &[u8; KEY_SIZE], salt: Option<&[u8]>, info: &[u8]) -> SealfsResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| SealfsError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Wrap (encrypt) the volume key under the key-encryption key.
///
/// Uses XChaCha20-Poly1305 with a random nonce.
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_volume_key(kek: &KeyEncryptionKey, volume_key: &VolumeKey) -> SealfsResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(kek.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, volume_key.as_bytes().as_ref())
        .map_err(|e| SealfsError::Crypto(format!("key wrapping failed: {e}")))?;

    let mut result = Vec::with_capacity(WRAPPED_KEY_SIZE);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap (decrypt) the volume key.
///
/// A tag failure means the passphrase was wrong (or the record was altered)
/// and is reported as [`SealfsError::Authentication`].
pub fn unwrap_volume_key(kek: &KeyEncryptionKey, wrapped: &[u8]) -> SealfsResult<VolumeKey> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(SealfsError::Config(format!(
            "wrapped key has wrong size: {} bytes (expected {})",
            wrapped.len(),
            WRAPPED_KEY_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(kek.as_bytes().into());

    let mut plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
        debug!("volume key unwrap rejected");
        SealfsError::Authentication("volume key unwrap failed: wrong passphrase or altered control record".into())
    })?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(VolumeKey::from_bytes(key_bytes))
}
