//! AES-256-GCM AEAD.
//!
//! Every onion layer is one seal/open under a hop key with a per-message
//! nonce. No associated data is bound.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

use crate::{CryptoError, Result};

/// Nonce size for AES-256-GCM (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Key size for AES-256-GCM (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// A 256-bit AEAD key.
pub type AeadKey = [u8; KEY_SIZE];

/// A 96-bit AEAD nonce.
pub type AeadNonce = [u8; NONCE_SIZE];

/// Encrypt `plaintext`, returning ciphertext with the 16-byte tag appended.
///
/// The nonce must never be reused with the same key.
pub fn seal(key: &AeadKey, nonce: &AeadNonce, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::AeadEncryption)
}

/// Decrypt and authenticate `ciphertext`.
///
/// # Errors
///
/// Returns [`CryptoError::AeadAuthentication`] if the tag does not verify.
pub fn open(key: &AeadKey, nonce: &AeadNonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AeadAuthentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let plaintext = b"through the onion";

        let ciphertext = seal(&key, &nonce, plaintext).expect("seal");
        let opened = open(&key, &nonce, &ciphertext).expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_ciphertext_has_tag() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let ciphertext = seal(&key, &nonce, b"test").expect("seal");
        assert_eq!(ciphertext.len(), 4 + TAG_SIZE);
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = [0x01u8; NONCE_SIZE];
        let ciphertext = seal(&[0x01u8; KEY_SIZE], &nonce, b"test").expect("seal");
        assert!(matches!(
            open(&[0x02u8; KEY_SIZE], &nonce, &ciphertext),
            Err(CryptoError::AeadAuthentication)
        ));
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = [0x01u8; KEY_SIZE];
        let ciphertext = seal(&key, &[0x01u8; NONCE_SIZE], b"test").expect("seal");
        assert!(open(&key, &[0x02u8; NONCE_SIZE], &ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0x01u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let mut ciphertext = seal(&key, &nonce, b"test").expect("seal");
        if let Some(byte) = ciphertext.first_mut() {
            *byte ^= 0xFF;
        }
        assert!(open(&key, &nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let ciphertext = seal(&key, &nonce, b"").expect("seal");
        assert_eq!(ciphertext.len(), TAG_SIZE);
        assert!(open(&key, &nonce, &ciphertext).expect("open").is_empty());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        assert!(open(&key, &nonce, &[0u8; TAG_SIZE - 1]).is_err());
    }
}
