//! Payload records carried inside cells.
//!
//! One record type per command. Records are CBOR-encoded; BEGIN, CONNECT and
//! DATA records are then onion-sealed by the sender, while EXTEND, CREATED,
//! BEGIN_ACK and END travel as plain CBOR.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::serde_as;

use crate::cbor;
use crate::cell::MAX_PAYLOAD_SIZE;
use crate::TransportError;

/// Upper bound on the CBOR framing a [`Data`] record adds around its bytes.
pub const DATA_RECORD_OVERHEAD: usize = 32;

/// CBOR encode/decode for a payload record.
pub trait Record: Serialize + DeserializeOwned {
    /// Type name used in error messages.
    const NAME: &'static str;

    fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        cbor::to_vec_named(self, Self::NAME)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        cbor::from_slice_named(data, Self::NAME)
    }
}

/// EXTEND: ask the receiving relay to become the next hop.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extend {
    /// Address of the hop after the receiver; empty for the last hop.
    pub next_hop: String,
    /// Client's ephemeral X25519 public key for this hop.
    #[serde_as(as = "serde_with::Bytes")]
    pub client_pub: [u8; 32],
}

/// CREATED: the relay's half of the hop handshake.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    #[serde_as(as = "serde_with::Bytes")]
    pub relay_pub: [u8; 32],
}

/// BEGIN: open a stream to `target` at the terminal hop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Begin {
    pub stream_id: u16,
    pub target: String,
}

/// BEGIN_ACK: the terminal hop opened the stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginAck {
    pub stream_id: u16,
}

/// CONNECT: attach the terminal hop to a hidden service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    /// Hidden-service endpoint; empty defers to the relay's default.
    pub target: String,
}

/// DATA: stream bytes.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub stream_id: u16,
    #[serde_as(as = "serde_with::Bytes")]
    pub data: Vec<u8>,
}

/// END: close one stream, or the whole circuit when `stream_id` is 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct End {
    pub stream_id: u16,
}

impl Record for Extend {
    const NAME: &'static str = "Extend";
}

impl Record for Created {
    const NAME: &'static str = "Created";
}

impl Record for Begin {
    const NAME: &'static str = "Begin";
}

impl Record for BeginAck {
    const NAME: &'static str = "BeginAck";
}

impl Record for Connect {
    const NAME: &'static str = "Connect";
}

impl Record for Data {
    const NAME: &'static str = "Data";
}

impl Record for End {
    const NAME: &'static str = "End";
}

/// Largest stream chunk that fits in one DATA cell once `onion_overhead`
/// bytes of AEAD tags are added.
pub fn max_data_chunk(onion_overhead: usize) -> usize {
    MAX_PAYLOAD_SIZE.saturating_sub(onion_overhead + DATA_RECORD_OVERHEAD)
}
