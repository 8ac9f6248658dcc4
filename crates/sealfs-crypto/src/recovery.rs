//! BIP-39 recovery phrase for the volume key
//!
//! The 256-bit volume key maps one-to-one onto a 24-word mnemonic. Anyone
//! holding the phrase can mount the volume without the passphrase, so it is
//! shown once and never written to the backing store.

use bip39::Mnemonic;
use sealfs_core::{SealfsError, SealfsResult};
use zeroize::Zeroize;

use crate::keys::VolumeKey;
use crate::KEY_SIZE;

/// Encode a volume key as a 24-word BIP-39 phrase.
pub fn volume_key_to_phrase(key: &VolumeKey) -> SealfsResult<String> {
    let mnemonic = Mnemonic::from_entropy(key.as_bytes())
        .map_err(|e| SealfsError::Crypto(format!("BIP-39 encoding failed: {e}")))?;
    Ok(mnemonic.to_string())
}

/// Recover a volume key from its 24-word phrase.
///
/// A phrase with a bad word or checksum is an `Authentication` failure.
pub fn phrase_to_volume_key(words: &str) -> SealfsResult<VolumeKey> {
    let mnemonic: Mnemonic = words
        .trim()
        .parse()
        .map_err(|e| SealfsError::Authentication(format!("invalid recovery phrase: {e}")))?;

    let mut entropy = mnemonic.to_entropy();
    if entropy.len() != KEY_SIZE {
        entropy.zeroize();
        return Err(SealfsError::Authentication(format!(
            "recovery phrase must have 24 words, got {}",
            mnemonic.word_count()
        )));
    }

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&entropy);
    entropy.zeroize();
    Ok(VolumeKey::from_bytes(bytes))
}
