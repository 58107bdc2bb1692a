//! Per-circuit identity key.
//!
//! Each circuit gets a fresh Ed25519 keypair when it is built. Only the
//! public half ever leaves the client; the signing key is dropped (and
//! zeroized by `ed25519-dalek`) when the circuit's keys are wiped.

use ed25519_dalek::SigningKey;

/// Ed25519 keypair bound to one circuit.
pub struct CircuitIdentity {
    signing_key: SigningKey,
}

impl CircuitIdentity {
    /// Generate a new identity from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}
