//! AES-SIV filename encryption
//!
//! Names must map deterministically so a plaintext path can be resolved
//! without listing directories. AES-SIV gives that with authentication; the
//! directory context goes in as associated data so equal names in different
//! directories encrypt differently.
//!
//! ```text
//! encoded = base64url( AES-256-SIV(name_key, ad = "sealfs-name" || ctx, pkcs7_16(name)) )
//! ```

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead, Nonce,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sealfs_core::{SealfsError, SealfsResult};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// Longest encoded segment the backing filesystem accepts
pub const MAX_ENCODED_NAME: usize = 255;

/// Size of a directory context
pub const DIR_CONTEXT_SIZE: usize = 16;

const PAD_BLOCK: usize = 16;
const NAME_DOMAIN: &[u8] = b"sealfs-name";
const LINK_DOMAIN: &[u8] = b"sealfs-link";

/// Per-directory associated data for name encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirContext([u8; DIR_CONTEXT_SIZE]);

impl DirContext {
    /// The context used in global mode.
    pub const fn zero() -> Self {
        Self([0u8; DIR_CONTEXT_SIZE])
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; DIR_CONTEXT_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DIR_CONTEXT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIR_CONTEXT_SIZE] {
        &self.0
    }
}

/// Deterministic, authenticated filename cipher.
///
/// Built once per mount from the volume's name key.
pub struct NameCipher {
    siv: Aes256SivAead,
}

impl NameCipher {
    pub fn new(name_key: &[u8; KEY_SIZE]) -> SealfsResult<Self> {
        // AES-256-SIV requires a 64-byte key (two 32-byte sub-keys)
        let mut double_key = [0u8; 64];
        let hkdf = hkdf::Hkdf::<sha2::Sha256>::new(None, name_key);
        hkdf.expand(b"sealfs-name-aes-siv", &mut double_key)
            .map_err(|e| SealfsError::Crypto(format!("HKDF expand for AES-SIV: {e}")))?;

        let siv = Aes256SivAead::new((&double_key).into());
        double_key.zeroize();
        Ok(Self { siv })
    }

    /// Encrypt one plaintext path segment under a directory context.
    pub fn encode(&self, name: &str, ctx: &DirContext) -> SealfsResult<String> {
        validate_name(name)?;

        let padded = pkcs7_pad(name.as_bytes());
        let encoded = self.seal(&padded, &name_aad(ctx))?;
        if encoded.len() > MAX_ENCODED_NAME {
            return Err(SealfsError::NameTooLong {
                len: encoded.len(),
                limit: MAX_ENCODED_NAME,
            });
        }
        Ok(encoded)
    }

    /// Decrypt one encoded path segment. Any failure is `InvalidName`.
    pub fn decode(&self, encoded: &str, ctx: &DirContext) -> SealfsResult<String> {
        let padded = self.open(encoded, &name_aad(ctx))?;
        if padded.is_empty() || padded.len() % PAD_BLOCK != 0 {
            return Err(SealfsError::InvalidName(format!("{encoded}: bad length")));
        }
        let unpadded = pkcs7_unpad(&padded)
            .ok_or_else(|| SealfsError::InvalidName(format!("{encoded}: bad padding")))?;
        let name = String::from_utf8(unpadded.to_vec())
            .map_err(|_| SealfsError::InvalidName(format!("{encoded}: not UTF-8")))?;
        validate_name(&name)?;
        Ok(name)
    }

    /// Encrypt a symlink target. Not bound to any directory, so a moved
    /// link still resolves.
    pub fn encode_target(&self, target: &str) -> SealfsResult<String> {
        if target.is_empty() {
            return Err(SealfsError::InvalidName("empty symlink target".into()));
        }
        self.seal(target.as_bytes(), LINK_DOMAIN)
    }

    pub fn decode_target(&self, encoded: &str) -> SealfsResult<String> {
        let raw = self.open(encoded, LINK_DOMAIN)?;
        String::from_utf8(raw)
            .map_err(|_| SealfsError::InvalidName(format!("{encoded}: link target not UTF-8")))
    }

    fn seal(&self, msg: &[u8], aad: &[u8]) -> SealfsResult<String> {
        // SIV is deterministic with a fixed zero nonce
        let ciphertext = self
            .siv
            .encrypt(&Nonce::default(), Payload { msg, aad })
            .map_err(|e| SealfsError::Crypto(format!("name encryption failed: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(ciphertext))
    }

    fn open(&self, encoded: &str, aad: &[u8]) -> SealfsResult<Vec<u8>> {
        let ciphertext = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| SealfsError::InvalidName(format!("{encoded}: {e}")))?;
        self.siv
            .decrypt(&Nonce::default(), Payload { msg: &ciphertext, aad })
            .map_err(|_| SealfsError::InvalidName(format!("{encoded}: authentication failed")))
    }
}

impl std::fmt::Debug for NameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCipher").finish_non_exhaustive()
    }
}

/// Reject names that cannot be a single path segment.
pub fn validate_name(name: &str) -> SealfsResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(SealfsError::InvalidName(format!("'{name}' is not a valid entry name")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(SealfsError::InvalidName(format!(
            "'{}' contains a path separator or NUL",
            name.escape_debug()
        )));
    }
    Ok(())
}

fn name_aad(ctx: &DirContext) -> Vec<u8> {
    let mut aad = Vec::with_capacity(NAME_DOMAIN.len() + DIR_CONTEXT_SIZE);
    aad.extend_from_slice(NAME_DOMAIN);
    aad.extend_from_slice(ctx.as_bytes());
    aad
}

fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = PAD_BLOCK - data.len() % PAD_BLOCK;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

fn pkcs7_unpad(data: &[u8]) -> Option<&[u8]> {
    let pad = *data.last()? as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > data.len() {
        return None;
    }
    let (body, tail) = data.split_at(data.len() - pad);
    tail.iter().all(|&b| b as usize == pad).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cipher() -> NameCipher {
        NameCipher::new(&[0x55u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let c = cipher();
        let ctx = DirContext::random();
        let encoded = c.encode("my-photo.jpg", &ctx).unwrap();
        assert_eq!(c.decode(&encoded, &ctx).unwrap(), "my-photo.jpg");
    }

    #[test]
    fn test_deterministic_encoding() {
        let c = cipher();
        let ctx = DirContext::from_bytes([3u8; DIR_CONTEXT_SIZE]);
        assert_eq!(
            c.encode("report.pdf", &ctx).unwrap(),
            c.encode("report.pdf", &ctx).unwrap(),
            "AES-SIV must be deterministic"
        );
    }

    #[test]
    fn test_context_changes_ciphertext() {
        let c = cipher();
        let a = c.encode("same.txt", &DirContext::from_bytes([1u8; 16])).unwrap();
        let b = c.encode("same.txt", &DirContext::from_bytes([2u8; 16])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_under_wrong_context_fails() {
        let c = cipher();
        let encoded = c.encode("secret.txt", &DirContext::from_bytes([1u8; 16])).unwrap();
        let result = c.decode(&encoded, &DirContext::from_bytes([2u8; 16]));
        assert!(matches!(result, Err(SealfsError::InvalidName(_))));
    }

    #[test]
    fn test_decode_wrong_key_fails() {
        let ctx = DirContext::zero();
        let encoded = NameCipher::new(&[0x11u8; KEY_SIZE]).unwrap().encode("a", &ctx).unwrap();
        let result = NameCipher::new(&[0x22u8; KEY_SIZE]).unwrap().decode(&encoded, &ctx);
        assert!(matches!(result, Err(SealfsError::InvalidName(_))));
    }

    #[test]
    fn test_short_names_share_length_bucket() {
        let c = cipher();
        let ctx = DirContext::zero();
        let one = c.encode("a", &ctx).unwrap();
        let fifteen = c.encode("abcdefghijklmno", &ctx).unwrap();
        assert_eq!(one.len(), 43);
        assert_eq!(fifteen.len(), 43);
        assert!(c.encode("abcdefghijklmnop", &ctx).unwrap().len() > 43);
    }

    #[test]
    fn test_encoded_names_are_path_safe() {
        let c = cipher();
        for name in ["a", "x.txt", "with space", "ünïcödé", ".hidden"] {
            let encoded = c.encode(name, &DirContext::zero()).unwrap();
            assert!(!encoded.starts_with('.'));
            assert!(!encoded.contains('/'));
            assert!(encoded
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        }
    }

    #[test]
    fn test_rejects_invalid_plaintext_names() {
        let c = cipher();
        for bad in ["", ".", "..", "a/b", "nul\0byte"] {
            assert!(
                matches!(c.encode(bad, &DirContext::zero()), Err(SealfsError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_name_too_long() {
        let c = cipher();
        let long = "x".repeat(200);
        let result = c.encode(&long, &DirContext::zero());
        assert!(matches!(result, Err(SealfsError::NameTooLong { limit: 255, .. })));
        assert!(c.encode(&"y".repeat(159), &DirContext::zero()).is_ok());
    }

    #[test]
    fn test_garbage_is_invalid_name() {
        let c = cipher();
        for junk in ["not base64!", "AAAA", "", "aGVsbG8"] {
            assert!(matches!(
                c.decode(junk, &DirContext::zero()),
                Err(SealfsError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_symlink_target_roundtrip() {
        let c = cipher();
        for target in ["/etc/hosts", "../sibling/file", "plain"] {
            let encoded = c.encode_target(target).unwrap();
            assert_eq!(c.decode_target(&encoded).unwrap(), target);
        }
    }

    #[test]
    fn test_target_and_name_domains_differ() {
        let c = cipher();
        let as_target = c.encode_target("abc").unwrap();
        assert!(c.decode(&as_target, &DirContext::zero()).is_err());
    }

    #[test]
    fn test_pkcs7() {
        assert_eq!(pkcs7_pad(b"").len(), 16);
        assert_eq!(pkcs7_pad(&[1u8; 16]).len(), 32);
        assert_eq!(pkcs7_unpad(&pkcs7_pad(b"hello")).unwrap(), b"hello");
        let mut bad = pkcs7_pad(b"hello");
        bad[14] = 0;
        assert!(pkcs7_unpad(&bad).is_none());
    }

    proptest! {
        #[test]
        fn names_roundtrip_and_hide_length(
            name in "[a-zA-Z0-9._ -]{1,120}".prop_filter("not dot names", |n| n != "." && n != ".."),
            ctx in any::<[u8; 16]>(),
        ) {
            let c = cipher();
            let ctx = DirContext::from_bytes(ctx);
            let encoded = c.encode(&name, &ctx).unwrap();
            prop_assert!(encoded.len() > 8);
            prop_assert_eq!(c.decode(&encoded, &ctx).unwrap(), name);
        }
    }
}
