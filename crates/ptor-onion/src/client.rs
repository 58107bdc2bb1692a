//! Stream operations over built circuits.
//!
//! [`OnionClient`] owns the circuit repository and a directory handle. All
//! sealing for one circuit happens under that circuit's lock together with
//! the write, so nonces reach the wire in counter order. Reads go through the
//! entry connection's inbound lock; events read while waiting for something
//! else (a BEGIN_ACK, say) are queued for [`OnionClient::next_event`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use ptor_crypto::nonce::NonceCategory;
use ptor_transport::frame::read_frame;
use ptor_transport::payload::{self, Begin, BeginAck, Connect, Data, End, Record};
use ptor_transport::{Cell, Command};
use ptor_types::{circuit_hex, CircuitId, StreamId, CONTROL_STREAM_ID};

use crate::build::{self, BuildOptions};
use crate::circuit::{ClientEvent, EntryConnection, Inbound};
use crate::directory::Directory;
use crate::repository::{CircuitHandle, CircuitRepository};
use crate::{OnionError, Result};

/// Client entry point.
pub struct OnionClient {
    directory: Arc<dyn Directory>,
    circuits: Arc<CircuitRepository>,
    defaults: BuildOptions,
}

impl OnionClient {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self::with_options(directory, BuildOptions::default())
    }

    /// Use `defaults` for timeouts; hop count and exit are per call.
    pub fn with_options(directory: Arc<dyn Directory>, defaults: BuildOptions) -> Self {
        Self {
            directory,
            circuits: Arc::new(CircuitRepository::new()),
            defaults,
        }
    }

    pub fn circuits(&self) -> &CircuitRepository {
        &self.circuits
    }

    /// Build and persist a circuit of `hops` relays, optionally ending at `exit`.
    pub async fn build_circuit(&self, hops: usize, exit: Option<&str>) -> Result<CircuitId> {
        let options = BuildOptions {
            hops,
            exit: exit.map(str::to_string),
            ..self.defaults.clone()
        };
        build::build_circuit(self.directory.as_ref(), &self.circuits, &options).await
    }

    /// Open a stream to `target` through the circuit's terminal hop.
    pub async fn open_stream(&self, circuit_id: &CircuitId, target: &str) -> Result<StreamId> {
        let handle = self.circuits.find(circuit_id)?;
        let (stream_id, conn) = {
            let mut circuit = handle.lock().await;
            let stream_id = circuit.open_stream(target)?;
            let begin = Begin {
                stream_id,
                target: target.to_string(),
            };
            let sealed = circuit.seal_outbound(NonceCategory::Begin, &begin.to_bytes()?)?;
            let conn = circuit.connection()?;
            conn.link
                .send_cell(circuit_id, &Cell::new(Command::Begin, sealed))
                .await?;
            (stream_id, conn)
        };

        if let Err(e) = self.await_ack(circuit_id, &handle, &conn, stream_id).await {
            handle.lock().await.remove_stream(stream_id);
            return Err(e);
        }
        debug!(circuit = %circuit_hex(circuit_id), stream = stream_id, %target, "stream open");
        Ok(stream_id)
    }

    /// Ask the terminal hop to attach to a hidden service. An empty `target`
    /// lets the relay use its configured default.
    pub async fn connect_hidden(&self, circuit_id: &CircuitId, target: &str) -> Result<()> {
        let handle = self.circuits.find(circuit_id)?;
        let conn = {
            let mut circuit = handle.lock().await;
            let connect = Connect {
                target: target.to_string(),
            };
            let sealed = circuit.seal_outbound(NonceCategory::Begin, &connect.to_bytes()?)?;
            let conn = circuit.connection()?;
            conn.link
                .send_cell(circuit_id, &Cell::new(Command::Connect, sealed))
                .await?;
            conn
        };
        self.await_ack(circuit_id, &handle, &conn, CONTROL_STREAM_ID).await?;
        debug!(circuit = %circuit_hex(circuit_id), %target, "hidden service attached");
        Ok(())
    }

    /// Resolve `address`, build a circuit ending at its owning relay, attach
    /// to the service and open one stream.
    pub async fn open_hidden(&self, address: &str, hops: usize) -> Result<(CircuitId, StreamId)> {
        let service = self.directory.hidden_service(address)?;
        let circuit_id = self.build_circuit(hops, Some(&service.relay_id)).await?;
        let target = service.endpoint.clone().unwrap_or_default();
        let opened = async {
            self.connect_hidden(&circuit_id, &target).await?;
            self.open_stream(&circuit_id, address).await
        };
        match opened.await {
            Ok(stream_id) => {
                info!(
                    circuit = %circuit_hex(&circuit_id),
                    %address,
                    relay = %service.relay_id,
                    "hidden stream open"
                );
                Ok((circuit_id, stream_id))
            }
            Err(e) => {
                if let Err(cleanup) = self.destroy_circuit(&circuit_id).await {
                    debug!(error = %cleanup, "cleanup after failed hidden open");
                }
                Err(e)
            }
        }
    }

    /// Send bytes on a stream, split to fit one cell per chunk.
    pub async fn send_data(
        &self,
        circuit_id: &CircuitId,
        stream_id: StreamId,
        data: &[u8],
    ) -> Result<()> {
        let handle = self.circuits.find(circuit_id)?;
        let mut circuit = handle.lock().await;
        if !circuit.is_stream_open(stream_id) {
            return Err(OnionError::StreamNotOpen(stream_id));
        }
        let chunk = payload::max_data_chunk(circuit.onion_overhead()).max(1);
        let conn = circuit.connection()?;
        for piece in data.chunks(chunk) {
            let record = Data {
                stream_id,
                data: piece.to_vec(),
            };
            let sealed = circuit.seal_outbound(NonceCategory::Data, &record.to_bytes()?)?;
            conn.link
                .send_cell(circuit_id, &Cell::new(Command::Data, sealed))
                .await?;
        }
        Ok(())
    }

    /// Next DATA, END or DESTROY on the circuit. BEGIN_ACKs are never
    /// returned here; they stay queued for the opener waiting on them.
    pub async fn next_event(&self, circuit_id: &CircuitId) -> Result<ClientEvent> {
        let handle = self.circuits.find(circuit_id)?;
        let conn = handle.lock().await.connection()?;
        let mut inbound = conn.inbound.lock().await;

        let queued = inbound
            .pending
            .iter()
            .position(|e| !matches!(e, ClientEvent::BeginAck { .. }));
        if let Some(event) = queued.and_then(|pos| inbound.pending.remove(pos)) {
            return Ok(event);
        }

        loop {
            match self.read_event(circuit_id, &handle, &mut inbound).await? {
                ack @ ClientEvent::BeginAck { .. } => inbound.pending.push_back(ack),
                event => return Ok(event),
            }
        }
    }

    /// Close one stream and tell the far end.
    pub async fn end_stream(&self, circuit_id: &CircuitId, stream_id: StreamId) -> Result<()> {
        let handle = self.circuits.find(circuit_id)?;
        let mut circuit = handle.lock().await;
        if !circuit.close_stream(stream_id) {
            debug!(circuit = %circuit_hex(circuit_id), stream = stream_id, "end on closed stream");
            return Ok(());
        }
        let end = End { stream_id };
        circuit
            .connection()?
            .link
            .send_cell(circuit_id, &Cell::new(Command::End, end.to_bytes()?))
            .await?;
        Ok(())
    }

    /// Send DESTROY, close the connection, wipe keys and forget the circuit.
    pub async fn destroy_circuit(&self, circuit_id: &CircuitId) -> Result<()> {
        let handle = self.circuits.remove(circuit_id).ok_or(OnionError::CircuitNotFound)?;
        let mut circuit = handle.lock().await;
        if let Ok(conn) = circuit.connection() {
            if let Err(e) = conn
                .link
                .send_cell(circuit_id, &Cell::empty(Command::Destroy))
                .await
            {
                debug!(circuit = %circuit_hex(circuit_id), error = %e, "DESTROY not delivered");
            }
            conn.link.shutdown().await;
        }
        circuit.destroy_all_streams();
        circuit.wipe_keys();
        info!(circuit = %circuit_hex(circuit_id), "circuit destroyed");
        Ok(())
    }

    async fn await_ack(
        &self,
        circuit_id: &CircuitId,
        handle: &CircuitHandle,
        conn: &EntryConnection,
        stream_id: StreamId,
    ) -> Result<()> {
        let mut inbound = conn.inbound.lock().await;
        let wanted = ClientEvent::BeginAck { stream_id };
        if let Some(pos) = inbound.pending.iter().position(|e| *e == wanted) {
            inbound.pending.remove(pos);
            return Ok(());
        }
        loop {
            match self.read_event(circuit_id, handle, &mut inbound).await? {
                event if event == wanted => return Ok(()),
                ClientEvent::Destroyed => {
                    inbound.pending.push_back(ClientEvent::Destroyed);
                    return Err(OnionError::CircuitDestroyed);
                }
                other => inbound.pending.push_back(other),
            }
        }
    }

    /// Read and decode one inbound cell for this circuit.
    async fn read_event(
        &self,
        circuit_id: &CircuitId,
        handle: &CircuitHandle,
        inbound: &mut Inbound,
    ) -> Result<ClientEvent> {
        let circuit = circuit_hex(circuit_id);
        loop {
            let (id, cell) = match read_frame(&mut inbound.reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(%circuit, "entry connection closed");
                    self.teardown(circuit_id, handle).await;
                    return Ok(ClientEvent::Destroyed);
                }
                Err(e) => {
                    warn!(%circuit, error = %e, "unreadable frame, dropping circuit");
                    self.teardown(circuit_id, handle).await;
                    return Err(e.into());
                }
            };
            if &id != circuit_id {
                warn!(%circuit, other = %circuit_hex(&id), "frame for foreign circuit");
                continue;
            }

            match cell.command {
                Command::Data => {
                    let plaintext = handle.lock().await.open_inbound(&cell.payload)?;
                    let data = Data::from_bytes(&plaintext)?;
                    return Ok(ClientEvent::Data {
                        stream_id: data.stream_id,
                        data: data.data,
                    });
                }
                Command::End => {
                    let end = End::from_bytes(&cell.payload)?;
                    let mut guard = handle.lock().await;
                    if end.stream_id == CONTROL_STREAM_ID {
                        guard.destroy_all_streams();
                    } else {
                        guard.remove_stream(end.stream_id);
                    }
                    return Ok(ClientEvent::End {
                        stream_id: end.stream_id,
                    });
                }
                Command::BeginAck => {
                    let ack = BeginAck::from_bytes(&cell.payload)?;
                    return Ok(ClientEvent::BeginAck {
                        stream_id: ack.stream_id,
                    });
                }
                Command::Destroy => {
                    info!(%circuit, "circuit destroyed by relay");
                    self.teardown(circuit_id, handle).await;
                    return Ok(ClientEvent::Destroyed);
                }
                other => {
                    debug!(%circuit, command = ?other, "ignoring cell");
                }
            }
        }
    }

    async fn teardown(&self, circuit_id: &CircuitId, handle: &CircuitHandle) {
        self.circuits.remove(circuit_id);
        let mut circuit = handle.lock().await;
        if let Ok(conn) = circuit.connection() {
            conn.link.close();
        }
        circuit.destroy_all_streams();
        circuit.wipe_keys();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use ptor_crypto::aead::{self, AeadKey, AeadNonce};
    use ptor_crypto::nonce::NonceCounters;
    use ptor_crypto::{kdf, x25519};
    use ptor_transport::link::Connection;
    use ptor_transport::payload::{Created, Extend};
    use ptor_types::directory::RelayInfo;
    use tokio::net::TcpListener;

    /// One-hop exit speaking the wire protocol by hand.
    struct FakeExit {
        conn: Connection,
        key: AeadKey,
        base: AeadNonce,
        counters: NonceCounters,
    }

    impl FakeExit {
        async fn accept(listener: TcpListener) -> Self {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut conn = Connection::from_tcp(stream);
            let (id, cell) = read_frame(&mut conn.reader).await.expect("read").expect("frame");
            assert_eq!(cell.command, Command::Extend);
            let extend = Extend::from_bytes(&cell.payload).expect("extend");
            assert!(extend.next_hop.is_empty());
            let (secret, public) = x25519::generate();
            let client_pub = x25519::X25519PublicKey::from_bytes(extend.client_pub);
            let shared = x25519::shared(&secret, &client_pub).expect("shared");
            let (key, base) = kdf::derive_key_nonce(shared.as_bytes());
            let created = Created {
                relay_pub: public.to_bytes(),
            };
            conn.link
                .send_created(&id, &created.to_bytes().expect("created"))
                .await
                .expect("send");
            Self {
                conn,
                key,
                base,
                counters: NonceCounters::new(),
            }
        }

        async fn recv(&mut self) -> (CircuitId, Cell) {
            read_frame(&mut self.conn.reader).await.expect("read").expect("frame")
        }

        fn open(&mut self, category: NonceCategory, payload: &[u8]) -> Vec<u8> {
            let nonce = self.counters.next(&self.base, category).expect("nonce");
            aead::open(&self.key, &nonce, payload).expect("open")
        }

        fn seal_upstream(&mut self, plaintext: &[u8]) -> Vec<u8> {
            let nonce = self
                .counters
                .next(&self.base, NonceCategory::UpstreamData)
                .expect("nonce");
            aead::seal(&self.key, &nonce, plaintext).expect("seal")
        }
    }

    async fn one_hop_client() -> (OnionClient, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let directory = StaticDirectory::from_relays(vec![RelayInfo {
            id: "exit".to_string(),
            addr: listener.local_addr().expect("addr").to_string(),
            public_key: [0u8; 32],
            online: true,
        }]);
        (OnionClient::new(Arc::new(directory)), listener)
    }

    #[tokio::test]
    async fn test_stream_lifecycle_against_fake_exit() {
        let (client, listener) = one_hop_client().await;
        let exit = tokio::spawn(async move {
            let mut exit = FakeExit::accept(listener).await;

            let (id, cell) = exit.recv().await;
            assert_eq!(cell.command, Command::Begin);
            let begin =
                Begin::from_bytes(&exit.open(NonceCategory::Begin, &cell.payload)).expect("begin");
            assert_eq!(begin.target, "example.com:80");
            let ack = BeginAck {
                stream_id: begin.stream_id,
            };
            exit.conn
                .link
                .send_cell(&id, &Cell::new(Command::BeginAck, ack.to_bytes().expect("ack")))
                .await
                .expect("send");

            let (_, cell) = exit.recv().await;
            assert_eq!(cell.command, Command::Data);
            let data =
                Data::from_bytes(&exit.open(NonceCategory::Data, &cell.payload)).expect("data");
            assert_eq!(data.data, b"ping");
            let reply = Data {
                stream_id: begin.stream_id,
                data: b"pong".to_vec(),
            };
            let sealed = exit.seal_upstream(&reply.to_bytes().expect("reply"));
            exit.conn
                .link
                .send_cell(&id, &Cell::new(Command::Data, sealed))
                .await
                .expect("send");

            let (_, cell) = exit.recv().await;
            assert_eq!(cell.command, Command::End);
            let end = End::from_bytes(&cell.payload).expect("end");
            assert_eq!(end.stream_id, begin.stream_id);

            let (_, cell) = exit.recv().await;
            assert_eq!(cell.command, Command::Destroy);
        });

        let circuit = client.build_circuit(1, None).await.expect("build");
        let stream = client.open_stream(&circuit, "example.com:80").await.expect("open");
        client.send_data(&circuit, stream, b"ping").await.expect("send");
        assert_eq!(
            client.next_event(&circuit).await.expect("event"),
            ClientEvent::Data {
                stream_id: stream,
                data: b"pong".to_vec()
            }
        );
        client.end_stream(&circuit, stream).await.expect("end");
        assert!(matches!(
            client.send_data(&circuit, stream, b"late").await,
            Err(OnionError::StreamNotOpen(_))
        ));
        client.destroy_circuit(&circuit).await.expect("destroy");
        assert!(client.circuits().is_empty());
        exit.await.expect("exit");
    }

    #[tokio::test]
    async fn test_open_stream_sees_destroy() {
        let (client, listener) = one_hop_client().await;
        let exit = tokio::spawn(async move {
            let mut exit = FakeExit::accept(listener).await;
            let (id, cell) = exit.recv().await;
            assert_eq!(cell.command, Command::Begin);
            exit.conn
                .link
                .send_cell(&id, &Cell::empty(Command::Destroy))
                .await
                .expect("send");
        });

        let circuit = client.build_circuit(1, None).await.expect("build");
        let err = client
            .open_stream(&circuit, "unreachable:1")
            .await
            .expect_err("destroyed");
        assert!(matches!(err, OnionError::CircuitDestroyed));
        assert!(matches!(client.circuits().find(&circuit), Err(OnionError::CircuitNotFound)));
        exit.await.expect("exit");
    }

    #[tokio::test]
    async fn test_unknown_circuit() {
        let (client, _listener) = one_hop_client().await;
        let id = [9u8; 16];
        assert!(matches!(
            client.open_stream(&id, "x:1").await,
            Err(OnionError::CircuitNotFound)
        ));
        assert!(matches!(
            client.destroy_circuit(&id).await,
            Err(OnionError::CircuitNotFound)
        ));
    }

    #[tokio::test]
    async fn test_open_hidden_unknown_address() {
        let (client, _listener) = one_hop_client().await;
        assert!(matches!(
            client.open_hidden("nowhere.ptor", 1).await,
            Err(OnionError::HiddenServiceNotFound(_))
        ));
    }
}
