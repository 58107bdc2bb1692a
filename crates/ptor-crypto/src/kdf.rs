//! Hop key and base-nonce derivation.
//!
//! Both come out of BLAKE3's key-derivation mode with registered context
//! strings, so the same shared secret always yields the same pair on the
//! client and on the relay.

use crate::aead::{AeadKey, AeadNonce, NONCE_SIZE};

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const HOP_KEY: &str = "ptor v1 hop-key";
    pub const HOP_NONCE: &str = "ptor v1 hop-nonce";

    /// All registered context strings.
    pub const ALL_CONTEXTS: &[&str] = &[HOP_KEY, HOP_NONCE];
}

/// Derive a 32-byte key using BLAKE3's key derivation mode.
pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
    ::blake3::derive_key(context, material)
}

/// Derive the hop key and base nonce from an X25519 shared secret.
pub fn derive_key_nonce(shared_secret: &[u8; 32]) -> (AeadKey, AeadNonce) {
    let key = derive_key(contexts::HOP_KEY, shared_secret);
    let nonce_full = derive_key(contexts::HOP_NONCE, shared_secret);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&nonce_full[..NONCE_SIZE]);
    (key, nonce)
}
