//! Client circuit entity.
//!
//! A circuit is an ordered list of hops, each with its own key, base nonce
//! and three nonce counters. Only hop 0 owns a live connection; every later
//! hop is reached through it.
//!
//! Counters only move forward. [`Circuit::wipe_keys`] zeroes all key material
//! and drops the identity key; every crypto accessor fails afterwards.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use zeroize::Zeroize;

use ptor_crypto::aead::{AeadKey, AeadNonce};
use ptor_crypto::identity::CircuitIdentity;
use ptor_crypto::nonce::{NonceCategory, NonceCounters};
use ptor_crypto::onion;
use ptor_transport::link::BoxReader;
use ptor_transport::Link;
use ptor_types::directory::RelayInfo;
use ptor_types::stream::StreamTable;
use ptor_types::{CircuitId, StreamId};

use crate::{OnionError, Result};

/// Key material negotiated with one hop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct HopKeys {
    pub key: AeadKey,
    pub base_nonce: AeadNonce,
}

/// Something the client read off its circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Stream bytes from the far end.
    Data { stream_id: StreamId, data: Vec<u8> },
    /// The far end closed a stream.
    End { stream_id: StreamId },
    /// The terminal hop acknowledged a BEGIN or CONNECT.
    BeginAck { stream_id: StreamId },
    /// The circuit was torn down.
    Destroyed,
}

/// Read side of the entry connection plus events read ahead of their consumer.
pub struct Inbound {
    pub reader: BoxReader,
    pub pending: VecDeque<ClientEvent>,
}

/// The single physical connection of a circuit, held by hop 0.
pub struct EntryConnection {
    pub link: Arc<Link>,
    pub inbound: Mutex<Inbound>,
}

impl EntryConnection {
    pub fn new(link: Arc<Link>, reader: BoxReader) -> Self {
        Self {
            link,
            inbound: Mutex::new(Inbound {
                reader,
                pending: VecDeque::new(),
            }),
        }
    }
}

/// One hop of a circuit.
pub struct Hop {
    pub relay: RelayInfo,
    keys: HopKeys,
    counters: NonceCounters,
    connection: Option<Arc<EntryConnection>>,
}

/// Client-side stream state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientStream {
    pub target: String,
    pub closed: bool,
}

/// A built circuit.
pub struct Circuit {
    id: CircuitId,
    hops: Vec<Hop>,
    identity: Option<CircuitIdentity>,
    streams: StreamTable<ClientStream>,
    wiped: bool,
}

impl Circuit {
    /// Assemble a circuit from negotiated hops. The connection is attached to
    /// hop 0 only.
    pub fn new(
        id: CircuitId,
        hops: Vec<(RelayInfo, HopKeys)>,
        identity: CircuitIdentity,
        connection: EntryConnection,
    ) -> Result<Self> {
        if hops.is_empty() {
            return Err(OnionError::InvalidHopCount(0));
        }
        let mut connection = Some(Arc::new(connection));
        let hops = hops
            .into_iter()
            .map(|(relay, keys)| Hop {
                relay,
                keys,
                counters: NonceCounters::new(),
                connection: connection.take(),
            })
            .collect();
        Ok(Self {
            id,
            hops,
            identity: Some(identity),
            streams: StreamTable::new(),
            wiped: false,
        })
    }

    pub fn id(&self) -> &CircuitId {
        &self.id
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Relay ids in path order.
    pub fn relay_ids(&self) -> Vec<String> {
        self.hops.iter().map(|h| h.relay.id.clone()).collect()
    }

    /// The entry connection, owned by hop 0.
    pub fn connection(&self) -> Result<Arc<EntryConnection>> {
        self.hops
            .first()
            .and_then(|h| h.connection.clone())
            .ok_or(OnionError::CircuitWiped)
    }

    /// Number of hops holding a live connection. Always 1 while alive.
    pub fn live_connections(&self) -> usize {
        self.hops.iter().filter(|h| h.connection.is_some()).count()
    }

    /// Public half of the circuit identity, if not yet wiped.
    pub fn identity_public_key(&self) -> Option<[u8; 32]> {
        self.identity.as_ref().map(CircuitIdentity::public_key)
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped
    }

    fn hop(&self, hop: usize) -> Result<&Hop> {
        if self.wiped {
            return Err(OnionError::CircuitWiped);
        }
        let hops = self.hops.len();
        self.hops.get(hop).ok_or(OnionError::HopOutOfRange { hop, hops })
    }

    fn hop_mut(&mut self, hop: usize) -> Result<&mut Hop> {
        if self.wiped {
            return Err(OnionError::CircuitWiped);
        }
        let hops = self.hops.len();
        self.hops
            .get_mut(hop)
            .ok_or(OnionError::HopOutOfRange { hop, hops })
    }

    /// Key of one hop.
    pub fn hop_key(&self, hop: usize) -> Result<AeadKey> {
        Ok(self.hop(hop)?.keys.key)
    }

    /// Base nonce of one hop.
    pub fn hop_base_nonce(&self, hop: usize) -> Result<AeadNonce> {
        Ok(self.hop(hop)?.keys.base_nonce)
    }

    /// Current counter value of one hop and category.
    pub fn hop_counter(&self, hop: usize, category: NonceCategory) -> Result<u64> {
        Ok(self.hop(hop)?.counters.get(category))
    }

    fn next_nonce(&mut self, hop: usize, category: NonceCategory) -> Result<AeadNonce> {
        let h = self.hop_mut(hop)?;
        Ok(h.counters.next(&h.keys.base_nonce, category)?)
    }

    fn peek_nonce(&self, hop: usize, category: NonceCategory) -> Result<AeadNonce> {
        let h = self.hop(hop)?;
        Ok(h.counters.peek(&h.keys.base_nonce, category)?)
    }

    pub fn hop_begin_nonce(&mut self, hop: usize) -> Result<AeadNonce> {
        self.next_nonce(hop, NonceCategory::Begin)
    }

    pub fn peek_hop_begin_nonce(&self, hop: usize) -> Result<AeadNonce> {
        self.peek_nonce(hop, NonceCategory::Begin)
    }

    pub fn hop_data_nonce(&mut self, hop: usize) -> Result<AeadNonce> {
        self.next_nonce(hop, NonceCategory::Data)
    }

    pub fn peek_hop_data_nonce(&self, hop: usize) -> Result<AeadNonce> {
        self.peek_nonce(hop, NonceCategory::Data)
    }

    pub fn hop_upstream_data_nonce(&mut self, hop: usize) -> Result<AeadNonce> {
        self.next_nonce(hop, NonceCategory::UpstreamData)
    }

    pub fn peek_hop_upstream_data_nonce(&self, hop: usize) -> Result<AeadNonce> {
        self.peek_nonce(hop, NonceCategory::UpstreamData)
    }

    fn keys(&self) -> Result<Vec<AeadKey>> {
        (0..self.hops.len()).map(|i| self.hop_key(i)).collect()
    }

    /// Onion-seal a record for the terminal hop, consuming one nonce of
    /// `category` at every hop.
    pub fn seal_outbound(&mut self, category: NonceCategory, plaintext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys()?;
        let nonces = (0..self.hops.len())
            .map(|i| self.next_nonce(i, category))
            .collect::<Result<Vec<_>>>()?;
        Ok(onion::onion_seal(&keys, &nonces, plaintext)?)
    }

    /// Open an upstream DATA payload layered by every hop. Counters advance
    /// only if every layer authenticates.
    pub fn open_inbound(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys()?;
        let nonces = (0..self.hops.len())
            .map(|i| self.peek_hop_upstream_data_nonce(i))
            .collect::<Result<Vec<_>>>()?;
        let plaintext = onion::onion_open(&keys, &nonces, ciphertext)?;
        for hop in &mut self.hops {
            hop.counters.advance(NonceCategory::UpstreamData);
        }
        Ok(plaintext)
    }

    /// Bytes of onion overhead on every sealed payload.
    pub fn onion_overhead(&self) -> usize {
        onion::overhead(self.hops.len())
    }

    /// Allocate a stream id for `target`.
    pub fn open_stream(&mut self, target: &str) -> Result<StreamId> {
        if self.wiped {
            return Err(OnionError::CircuitWiped);
        }
        Ok(self.streams.allocate(ClientStream {
            target: target.to_string(),
            closed: false,
        })?)
    }

    /// Mark a stream closed. Returns false if it was not open.
    pub fn close_stream(&mut self, stream_id: StreamId) -> bool {
        match self.streams.get_mut(stream_id) {
            Some(stream) if !stream.closed => {
                stream.closed = true;
                true
            }
            _ => false,
        }
    }

    /// Forget a stream entirely.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Option<ClientStream> {
        self.streams.remove(stream_id)
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&ClientStream> {
        self.streams.get(stream_id)
    }

    pub fn is_stream_open(&self, stream_id: StreamId) -> bool {
        self.streams.get(stream_id).is_some_and(|s| !s.closed)
    }

    pub fn active_streams(&self) -> Vec<StreamId> {
        self.streams.ids_where(|s| !s.closed)
    }

    /// Drop every stream.
    pub fn destroy_all_streams(&mut self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .streams
            .drain_all()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Zero every hop key and base nonce, drop the identity key and the
    /// entry connection handle. The circuit is unusable afterwards.
    pub fn wipe_keys(&mut self) {
        for hop in &mut self.hops {
            hop.keys.zeroize();
            hop.connection = None;
        }
        self.identity = None;
        self.wiped = true;
    }
}
