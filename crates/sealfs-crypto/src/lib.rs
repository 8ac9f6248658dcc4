//! sealfs-crypto: cryptography for an encrypted overlay volume
//!
//! Key hierarchy:
//! ```text
//! Passphrase ──Argon2id(salt)──▶ Key-Encryption Key
//!                                   │ XChaCha20-Poly1305 unwrap
//!                                   ▼
//!                              Volume Key (256-bit random, stored wrapped)
//!   ├── Content Key (HKDF "sealfs-content")
//!   │     └── File Key (HKDF, salt = per-file IV seed)
//!   │           └── Block cipher: XChaCha20(file_key, iv = BLAKE3-keyed(file_key, index))
//!   ├── Block MAC Key (HKDF "sealfs-block-mac", keyed BLAKE3 over iv || ciphertext)
//!   ├── Name Key (HKDF "sealfs-names", AES-256-SIV, AD = directory context)
//!   └── Binding Key (HKDF "sealfs-binding", masks header seeds in path-bound mode)
//! ```

pub mod cipher;
pub mod kdf;
pub mod keys;
pub mod names;
pub mod recovery;

pub use cipher::{block_iv, block_tag, decrypt_block, encrypt_block, mac, verify_tag, BlockIv, Tag};
pub use kdf::{derive_kek, generate_salt, KdfParams, KeyEncryptionKey};
pub use keys::{
    generate_volume_key, unwrap_volume_key, wrap_volume_key, FileKey, VolumeKey, VolumeKeys,
    WRAPPED_KEY_SIZE,
};
pub use names::{validate_name, DirContext, NameCipher, DIR_CONTEXT_SIZE, MAX_ENCODED_NAME};
pub use recovery::{phrase_to_volume_key, volume_key_to_phrase};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const AEAD_TAG_SIZE: usize = 16;

/// Size of the per-block authentication tag (truncated keyed BLAKE3)
pub const TAG_SIZE: usize = 16;

/// Size of a per-file IV seed
pub const SEED_SIZE: usize = 16;

/// Size of the Argon2id salt
pub const SALT_SIZE: usize = 16;

/// Identifier recorded in the control record for this cipher suite
pub const CIPHER_ID: &str = "xchacha20-blake3-aessiv";
