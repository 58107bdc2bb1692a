//! X25519 key agreement (RFC 7748).
//!
//! Each circuit hop runs one ephemeral agreement: the client sends its public
//! key in EXTEND, the relay answers with its own in CREATED.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// An X25519 secret key.
///
/// Held only for the duration of one handshake, but kept as a
/// `StaticSecret` so it can be borrowed for the agreement.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519Secret {
    inner: StaticSecret,
}

/// An X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; 32],
}

/// An X25519 shared secret.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl X25519Secret {
    /// Generate a new random secret.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Compute the corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey {
            bytes: PublicKey::from(&self.inner).to_bytes(),
        }
    }
}

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Get the raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl SharedSecret {
    /// Get the raw bytes of the shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Generate an ephemeral keypair.
pub fn generate() -> (X25519Secret, X25519PublicKey) {
    let secret = X25519Secret::random();
    let public = secret.public_key();
    (secret, public)
}

/// Agree on a shared secret with a peer.
///
/// # Errors
///
/// Returns [`CryptoError::KeyAgreement`] if the peer sent a low-order point
/// and the result is all zeros.
pub fn shared(secret: &X25519Secret, peer: &X25519PublicKey) -> Result<SharedSecret> {
    let shared = secret.inner.diffie_hellman(&PublicKey::from(peer.bytes));
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement);
    }
    Ok(SharedSecret {
        bytes: *shared.as_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let (_secret, public) = generate();
        assert_ne!(public.to_bytes(), [0u8; 32]);
    }

    #[test]
    fn test_agreement() {
        let (alice, alice_pub) = generate();
        let (bob, bob_pub) = generate();

        let a = shared(&alice, &bob_pub).expect("alice");
        let b = shared(&bob, &alice_pub).expect("bob");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let (secret, _) = generate();
        let zero = X25519PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(shared(&secret, &zero), Err(CryptoError::KeyAgreement)));
    }

    #[test]
    fn test_rfc7748_section6_1() {
        let alice_private =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .expect("valid hex");
        let alice_public =
            hex::decode("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
                .expect("valid hex");
        let bob_public =
            hex::decode("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
                .expect("valid hex");
        let expected_shared =
            hex::decode("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742")
                .expect("valid hex");

        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(&alice_private);
        let secret = X25519Secret::from_bytes(secret_bytes);
        assert_eq!(secret.public_key().as_bytes().as_slice(), alice_public.as_slice());

        let mut bob_bytes = [0u8; 32];
        bob_bytes.copy_from_slice(&bob_public);
        let agreed = shared(&secret, &X25519PublicKey::from_bytes(bob_bytes)).expect("shared");
        assert_eq!(agreed.as_bytes().as_slice(), expected_shared.as_slice());
    }
}
