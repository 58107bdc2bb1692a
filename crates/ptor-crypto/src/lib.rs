//! # ptor-crypto
//!
//! Cryptographic primitives for ptor circuits. The suite is fixed; there is
//! no negotiation.
//!
//! ## Modules
//!
//! - [`aead`] — AES-256-GCM seal/open, 96-bit nonces, no associated data
//! - [`onion`] — Multi-layer onion seal/open over per-hop keys
//! - [`x25519`] — X25519 key agreement (RFC 7748)
//! - [`kdf`] — BLAKE3 key/nonce derivation from a shared secret
//! - [`nonce`] — Counter-based per-message nonce derivation
//! - [`identity`] — Per-circuit Ed25519 identity key

pub mod aead;
pub mod identity;
pub mod kdf;
pub mod nonce;
pub mod onion;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    AeadEncryption,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD authentication failed")]
    AeadAuthentication,

    /// Onion layer count mismatch between keys and nonces.
    #[error("layer mismatch: {keys} keys, {nonces} nonces")]
    LayerMismatch { keys: usize, nonces: usize },

    /// Onion operation requested with zero layers.
    #[error("onion operation needs at least one layer")]
    NoLayers,

    /// X25519 agreement produced a non-contributory (all-zero) secret.
    #[error("key agreement produced a low-order shared secret")]
    KeyAgreement,

    /// A nonce counter reached the end of its partition.
    #[error("nonce counter exhausted for {0:?}")]
    CounterExhausted(nonce::NonceCategory),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
