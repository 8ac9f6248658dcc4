//! Per-block content cipher and block authentication
//!
//! Each block is encrypted with the XChaCha20 keystream under the file key,
//! so ciphertext is exactly as long as plaintext:
//! ```text
//! iv_i    = BLAKE3-keyed(file_key, "sealfs-block-iv" || i as u64 BE)[..24]
//! ct_i    = pt_i XOR XChaCha20(file_key, iv_i)
//! tag_i   = BLAKE3-keyed(mac_key, iv_i || ct_i)[..16]      (integrity mode only)
//! ```
//!
//! The IV depends only on the file key (that is, the file's seed) and the
//! block index, so any block can be rewritten on its own.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use subtle::ConstantTimeEq;

use crate::keys::FileKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub type BlockIv = [u8; NONCE_SIZE];
pub type Tag = [u8; TAG_SIZE];

/// Derive the IV of block `index` of a file.
pub fn block_iv(file_key: &FileKey, index: u64) -> BlockIv {
    let mut hasher = blake3::Hasher::new_keyed(file_key.as_bytes());
    hasher.update(b"sealfs-block-iv");
    hasher.update(&index.to_be_bytes());
    let hash = hasher.finalize();

    let mut iv = [0u8; NONCE_SIZE];
    iv.copy_from_slice(&hash.as_bytes()[..NONCE_SIZE]);
    iv
}

/// XOR `buf` in place with the keystream for (`key`, `iv`).
pub fn apply_keystream(key: &FileKey, iv: &BlockIv, buf: &mut [u8]) {
    let mut cipher = XChaCha20::new(Key::from_slice(key.as_bytes()), XNonce::from_slice(iv));
    cipher.apply_keystream(buf);
}

/// Encrypt one block. Length preserving and deterministic.
pub fn encrypt_block(key: &FileKey, iv: &BlockIv, plaintext: &[u8]) -> Vec<u8> {
    let mut out = plaintext.to_vec();
    apply_keystream(key, iv, &mut out);
    out
}

/// Decrypt one block. Inverse of [`encrypt_block`].
pub fn decrypt_block(key: &FileKey, iv: &BlockIv, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = ciphertext.to_vec();
    apply_keystream(key, iv, &mut out);
    out
}

/// Keyed BLAKE3, truncated to [`TAG_SIZE`].
pub fn mac(key: &[u8; KEY_SIZE], data: &[u8]) -> Tag {
    let hash = blake3::keyed_hash(key, data);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&hash.as_bytes()[..TAG_SIZE]);
    tag
}

/// Tag for one stored block: MAC over `iv || ciphertext`.
pub fn block_tag(mac_key: &[u8; KEY_SIZE], iv: &BlockIv, ciphertext: &[u8]) -> Tag {
    let mut hasher = blake3::Hasher::new_keyed(mac_key);
    hasher.update(iv);
    hasher.update(ciphertext);
    let hash = hasher.finalize();

    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&hash.as_bytes()[..TAG_SIZE]);
    tag
}

/// Constant-time tag comparison.
pub fn verify_tag(expected: &Tag, actual: &[u8]) -> bool {
    actual.len() == TAG_SIZE && bool::from(expected[..].ct_eq(actual))
}
