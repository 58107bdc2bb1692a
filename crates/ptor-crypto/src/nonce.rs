//! Per-message nonce derivation.
//!
//! A hop owns one key, one 96-bit base nonce and three monotonic counters,
//! one per message category. The category is tagged into the top two bits
//! of the counter before it is XORed into the low eight bytes of the base,
//! so the three categories never share a nonce under the same key.

use zeroize::Zeroize;

use crate::aead::AeadNonce;
use crate::{CryptoError, Result};

/// Counters must stay below this so the category tag stays intact.
pub const COUNTER_LIMIT: u64 = 1 << 62;

/// Message categories with independent counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NonceCategory {
    /// BEGIN and CONNECT cells.
    Begin,
    /// DATA travelling away from the client.
    Data,
    /// DATA travelling towards the client.
    UpstreamData,
}

impl NonceCategory {
    fn tag(self) -> u64 {
        match self {
            NonceCategory::Begin => 0,
            NonceCategory::Data => 1,
            NonceCategory::UpstreamData => 2,
        }
    }
}

/// XOR a 64-bit counter (big-endian) into the low 8 bytes of `base`.
pub fn nonce_for_counter(base: &AeadNonce, counter: u64) -> AeadNonce {
    let mut nonce = *base;
    for (slot, byte) in nonce[4..].iter_mut().zip(counter.to_be_bytes()) {
        *slot ^= byte;
    }
    nonce
}

/// The three per-hop counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Zeroize)]
pub struct NonceCounters {
    begin: u64,
    data: u64,
    upstream_data: u64,
}

impl NonceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a category counter.
    pub fn get(&self, category: NonceCategory) -> u64 {
        match category {
            NonceCategory::Begin => self.begin,
            NonceCategory::Data => self.data,
            NonceCategory::UpstreamData => self.upstream_data,
        }
    }

    fn slot(&mut self, category: NonceCategory) -> &mut u64 {
        match category {
            NonceCategory::Begin => &mut self.begin,
            NonceCategory::Data => &mut self.data,
            NonceCategory::UpstreamData => &mut self.upstream_data,
        }
    }

    /// Nonce the next message of `category` will use, without consuming it.
    pub fn peek(&self, base: &AeadNonce, category: NonceCategory) -> Result<AeadNonce> {
        let counter = self.get(category);
        if counter >= COUNTER_LIMIT {
            return Err(CryptoError::CounterExhausted(category));
        }
        Ok(nonce_for_counter(base, (category.tag() << 62) | counter))
    }

    /// Nonce for the next message of `category`; advances its counter.
    pub fn next(&mut self, base: &AeadNonce, category: NonceCategory) -> Result<AeadNonce> {
        let nonce = self.peek(base, category)?;
        *self.slot(category) += 1;
        Ok(nonce)
    }

    /// Advance a counter whose nonce was obtained with [`peek`](Self::peek).
    pub fn advance(&mut self, category: NonceCategory) {
        *self.slot(category) += 1;
    }
}
