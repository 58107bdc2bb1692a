//! Layered (onion) sealing across circuit hops.
//!
//! Keys and nonces are ordered first hop first. Sealing applies the exit
//! hop's layer first and the first hop's layer last, so the first relay
//! peels exactly one layer and finds a ciphertext meant for the second
//! relay, and so on. Opening walks the other way.

use crate::aead::{self, AeadKey, AeadNonce};
use crate::{CryptoError, Result};

fn check_layers(keys: usize, nonces: usize) -> Result<()> {
    if keys != nonces {
        return Err(CryptoError::LayerMismatch { keys, nonces });
    }
    if keys == 0 {
        return Err(CryptoError::NoLayers);
    }
    Ok(())
}

/// Seal `plaintext` under every hop key, innermost (exit) layer first.
pub fn onion_seal(keys: &[AeadKey], nonces: &[AeadNonce], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_layers(keys.len(), nonces.len())?;
    let mut data = plaintext.to_vec();
    for (key, nonce) in keys.iter().zip(nonces).rev() {
        data = aead::seal(key, nonce, &data)?;
    }
    Ok(data)
}

/// Open an onion ciphertext, outermost (first hop) layer first.
pub fn onion_open(keys: &[AeadKey], nonces: &[AeadNonce], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_layers(keys.len(), nonces.len())?;
    let mut data = ciphertext.to_vec();
    for (key, nonce) in keys.iter().zip(nonces) {
        data = aead::open(key, nonce, &data)?;
    }
    Ok(data)
}

/// Bytes of tag overhead added by an onion of `layers` hops.
pub fn overhead(layers: usize) -> usize {
    layers * aead::TAG_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::TAG_SIZE;

    fn material(hops: usize) -> (Vec<AeadKey>, Vec<AeadNonce>) {
        let keys = (0..hops).map(|i| [i as u8 + 1; 32]).collect();
        let nonces = (0..hops).map(|i| [0xA0 + i as u8; 12]).collect();
        (keys, nonces)
    }

    #[test]
    fn test_roundtrip_one_to_five_hops() {
        let plaintext = b"layered payload";
        for hops in 1..=5 {
            let (keys, nonces) = material(hops);
            let sealed = onion_seal(&keys, &nonces, plaintext).expect("seal");
            assert_eq!(sealed.len(), plaintext.len() + overhead(hops));
            let opened = onion_open(&keys, &nonces, &sealed).expect("open");
            assert_eq!(opened, plaintext, "hops = {hops}");
        }
    }

    #[test]
    fn test_first_hop_peels_one_layer() {
        let (keys, nonces) = material(3);
        let sealed = onion_seal(&keys, &nonces, b"x").expect("seal");

        let after_first = aead::open(&keys[0], &nonces[0], &sealed).expect("peel hop 0");
        let inner = onion_seal(&keys[1..], &nonces[1..], b"x").expect("seal inner");
        assert_eq!(after_first, inner);
    }

    #[test]
    fn test_exit_layer_is_innermost() {
        let (keys, nonces) = material(2);
        let sealed = onion_seal(&keys, &nonces, b"exit data").expect("seal");
        let hop0 = aead::open(&keys[0], &nonces[0], &sealed).expect("hop 0");
        assert_eq!(hop0.len(), b"exit data".len() + TAG_SIZE);
        let hop1 = aead::open(&keys[1], &nonces[1], &hop0).expect("hop 1");
        assert_eq!(hop1, b"exit data");
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let (keys, nonces) = material(3);
        assert!(matches!(
            onion_seal(&keys, &nonces[..2], b"x"),
            Err(CryptoError::LayerMismatch { keys: 3, nonces: 2 })
        ));
        assert!(matches!(
            onion_open(&keys[..1], &nonces, b"x"),
            Err(CryptoError::LayerMismatch { keys: 1, nonces: 3 })
        ));
    }

    #[test]
    fn test_zero_layers_rejected() {
        assert!(matches!(onion_seal(&[], &[], b"x"), Err(CryptoError::NoLayers)));
    }

    #[test]
    fn test_wrong_order_fails() {
        let (keys, nonces) = material(2);
        let sealed = onion_seal(&keys, &nonces, b"x").expect("seal");
        let reversed_keys: Vec<AeadKey> = keys.iter().rev().copied().collect();
        let reversed_nonces: Vec<AeadNonce> = nonces.iter().rev().copied().collect();
        assert!(onion_open(&reversed_keys, &reversed_nonces, &sealed).is_err());
    }
}
