//! Per-circuit relay state.
//!
//! A `ConnState` holds the hop key and base nonce negotiated on EXTEND, the
//! three nonce counters, the upstream link and, for middle and hidden hops,
//! the downstream link. Counters live behind an async mutex that is held
//! across seal and write, so sealed cells leave in counter order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use zeroize::Zeroize;

use ptor_crypto::aead::{self, AeadKey, AeadNonce};
use ptor_crypto::nonce::{NonceCategory, NonceCounters};
use ptor_transport::frame::read_created;
use ptor_transport::link::{BoxReader, Connection};
use ptor_transport::payload::{Data, Record};
use ptor_transport::{Cell, Command, Link};
use ptor_types::{CircuitId, StreamId};

use crate::{RelayError, Result};

#[derive(Zeroize)]
#[zeroize(drop)]
struct HopSecret {
    key: AeadKey,
    base_nonce: AeadNonce,
}

/// Next relay or hidden service.
pub struct Downstream {
    pub link: Arc<Link>,
    /// Taken for good by the downstream pump; borrowed by forward-EXTEND.
    reader: Mutex<Option<BoxReader>>,
}

impl Downstream {
    pub fn new(conn: Connection) -> Self {
        Self {
            link: conn.link,
            reader: Mutex::new(Some(conn.reader)),
        }
    }

    /// Send an EXTEND down and read the CREATED answer. Holds the reader
    /// for the whole exchange; fails if a pump already took it.
    pub async fn exchange_extend(
        &self,
        circuit_id: &CircuitId,
        extend: &Cell,
    ) -> Result<(CircuitId, Vec<u8>)> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(RelayError::ReaderBusy)?;
        self.link.send_cell(circuit_id, extend).await?;
        Ok(read_created(reader).await?)
    }

    /// Hand the reader to a pump. `None` once taken.
    pub async fn take_reader(&self) -> Option<BoxReader> {
        self.reader.lock().await.take()
    }
}

/// Relay-side state of one circuit.
pub struct ConnState {
    secret: HopSecret,
    counters: Arc<Mutex<NonceCounters>>,
    pub up: Arc<Link>,
    pub down: Option<Downstream>,
    hidden: bool,
    served: AtomicBool,
}

impl ConnState {
    pub fn new(
        key: AeadKey,
        base_nonce: AeadNonce,
        up: Arc<Link>,
        down: Option<Downstream>,
    ) -> Self {
        Self {
            secret: HopSecret { key, base_nonce },
            counters: Arc::new(Mutex::new(NonceCounters::new())),
            up,
            down,
            hidden: false,
            served: AtomicBool::new(false),
        }
    }

    /// Terminal state attached to a hidden service. Keys and counters carry
    /// over; the pump guard starts fresh.
    pub fn to_hidden(&self, service: Downstream) -> Self {
        Self {
            secret: HopSecret {
                key: self.secret.key,
                base_nonce: self.secret.base_nonce,
            },
            counters: Arc::clone(&self.counters),
            up: Arc::clone(&self.up),
            down: Some(service),
            hidden: true,
            served: AtomicBool::new(false),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Forwards to another relay.
    pub fn is_middle(&self) -> bool {
        self.down.is_some() && !self.hidden
    }

    /// Next relay link, for middle hops only.
    pub fn next_relay(&self) -> Option<&Downstream> {
        self.down.as_ref().filter(|_| !self.hidden)
    }

    /// Hidden-service link, for hidden hops only.
    pub fn hidden_service(&self) -> Option<&Downstream> {
        self.down.as_ref().filter(|_| self.hidden)
    }

    /// Flip `served` once. Only the caller that gets `true` starts a pump.
    pub fn mark_served(&self) -> bool {
        self.served
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_served(&self) -> bool {
        self.served.load(Ordering::Acquire)
    }

    pub async fn counter(&self, category: NonceCategory) -> u64 {
        self.counters.lock().await.get(category)
    }

    async fn open_with(&self, category: NonceCategory, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut counters = self.counters.lock().await;
        let nonce = counters.peek(&self.secret.base_nonce, category)?;
        let plaintext = aead::open(&self.secret.key, &nonce, ciphertext)?;
        counters.advance(category);
        Ok(plaintext)
    }

    /// Peel one layer of a BEGIN or CONNECT payload.
    pub async fn open_begin(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.open_with(NonceCategory::Begin, ciphertext).await
    }

    /// Peel one layer of a downstream DATA payload. The counter moves only
    /// when the layer authenticates.
    pub async fn open_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.open_with(NonceCategory::Data, ciphertext).await
    }

    /// Add one layer with the upstream-DATA nonce and send it up as DATA.
    pub async fn seal_upstream(&self, circuit_id: &CircuitId, plaintext: &[u8]) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let nonce = counters.next(&self.secret.base_nonce, NonceCategory::UpstreamData)?;
        let sealed = aead::seal(&self.secret.key, &nonce, plaintext)?;
        self.up
            .send_cell(circuit_id, &Cell::new(Command::Data, sealed))
            .await?;
        Ok(())
    }

    /// Wrap stream bytes into a DATA record and send them up.
    pub async fn send_stream_data(
        &self,
        circuit_id: &CircuitId,
        stream_id: StreamId,
        data: &[u8],
    ) -> Result<()> {
        let record = Data {
            stream_id,
            data: data.to_vec(),
        };
        self.seal_upstream(circuit_id, &record.to_bytes()?).await
    }

    /// Close every link this state holds.
    pub fn close(&self) {
        close_link(&self.up);
        if let Some(down) = &self.down {
            close_link(&down.link);
        }
    }
}

/// Mark a link closed and shut its write half down in the background.
pub fn close_link(link: &Arc<Link>) {
    if link.is_closed() {
        return;
    }
    link.close();
    let link = Arc::clone(link);
    tokio::spawn(async move { link.shutdown().await });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ptor_transport::frame::read_frame;

    pub(crate) fn pipe(peer: &str) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Connection::from_parts(peer, Box::new(ar), Box::new(aw)),
            Connection::from_parts("far", Box::new(br), Box::new(bw)),
        )
    }

    pub(crate) const KEY: AeadKey = [0x42; 32];
    pub(crate) const BASE: AeadNonce = [0x24; 12];

    fn terminal() -> (ConnState, Connection) {
        let (up, far) = pipe("up");
        (ConnState::new(KEY, BASE, up.link, None), far)
    }

    #[tokio::test]
    async fn test_mark_served_once() {
        let (state, _far) = terminal();
        assert!(!state.is_served());
        assert!(state.mark_served());
        assert!(!state.mark_served());
        assert!(state.is_served());
    }

    #[tokio::test]
    async fn test_open_data_advances_only_on_success() {
        let (state, _far) = terminal();
        let nonce = NonceCounters::new()
            .peek(&BASE, NonceCategory::Data)
            .expect("nonce");
        let sealed = aead::seal(&KEY, &nonce, b"hello").expect("seal");

        assert!(state.open_data(b"garbage that will not authenticate").await.is_err());
        assert_eq!(state.counter(NonceCategory::Data).await, 0);

        assert_eq!(state.open_data(&sealed).await.expect("open"), b"hello");
        assert_eq!(state.counter(NonceCategory::Data).await, 1);
        assert_eq!(state.counter(NonceCategory::Begin).await, 0);
    }

    #[tokio::test]
    async fn test_seal_upstream_sends_data_cell() {
        let (state, mut far) = terminal();
        state
            .send_stream_data(&[1u8; 16], 3, b"reply")
            .await
            .expect("send");
        let (id, cell) = read_frame(&mut far.reader).await.expect("read").expect("frame");
        assert_eq!(id, [1u8; 16]);
        assert_eq!(cell.command, Command::Data);

        let nonce = NonceCounters::new()
            .peek(&BASE, NonceCategory::UpstreamData)
            .expect("nonce");
        let plain = aead::open(&KEY, &nonce, &cell.payload).expect("open");
        let record = Data::from_bytes(&plain).expect("data");
        assert_eq!(record.stream_id, 3);
        assert_eq!(record.data, b"reply");
        assert_eq!(state.counter(NonceCategory::UpstreamData).await, 1);
    }

    #[tokio::test]
    async fn test_to_hidden_preserves_counters() {
        let (state, _far) = terminal();
        let nonce = NonceCounters::new()
            .peek(&BASE, NonceCategory::Begin)
            .expect("nonce");
        let sealed = aead::seal(&KEY, &nonce, b"connect").expect("seal");
        state.open_begin(&sealed).await.expect("open");
        state.mark_served();

        let (service, _svc_far) = pipe("hidden");
        let hidden = state.to_hidden(Downstream::new(service));
        assert!(hidden.is_hidden());
        assert!(!hidden.is_middle());
        assert!(hidden.hidden_service().is_some());
        assert!(hidden.next_relay().is_none());
        assert!(!hidden.is_served());
        assert_eq!(hidden.counter(NonceCategory::Begin).await, 1);
    }

    #[tokio::test]
    async fn test_exchange_extend_and_take() {
        let (down, mut far) = pipe("down");
        let down = Downstream::new(down);
        let id = [5u8; 16];
        let answer = tokio::spawn(async move {
            let (got, cell) = read_frame(&mut far.reader).await.expect("read").expect("frame");
            assert_eq!(cell.command, Command::Extend);
            far.link.send_created(&got, b"created").await.expect("send");
            far
        });

        let (answered, payload) = down
            .exchange_extend(&id, &Cell::new(Command::Extend, vec![1, 2, 3]))
            .await
            .expect("exchange");
        assert_eq!(answered, id);
        assert_eq!(payload, b"created");
        let _far = answer.await.expect("peer");

        assert!(down.take_reader().await.is_some());
        assert!(down.take_reader().await.is_none());
        assert!(matches!(
            down.exchange_extend(&id, &Cell::empty(Command::Extend)).await,
            Err(RelayError::ReaderBusy)
        ));
    }

    #[tokio::test]
    async fn test_close_marks_links() {
        let (up, _up_far) = pipe("up");
        let (down, _down_far) = pipe("down");
        let state = ConnState::new(KEY, BASE, up.link, Some(Downstream::new(down)));
        assert!(state.is_middle());
        state.close();
        assert!(state.up.is_closed());
        assert!(state.down.as_ref().map(|d| d.link.is_closed()).unwrap_or(false));
    }
}
