//! Relay cell-dispatch engine.
//!
//! One [`Engine`] per relay routes every inbound `(circuit, cell)` pair. With
//! no state for the circuit only EXTEND (create state) and END (ignored) are
//! accepted. With state, each command has its own handler:
//!
//! | command | middle hop | terminal hop | hidden hop |
//! |---|---|---|---|
//! | EXTEND | forward, relay CREATED back | - | - |
//! | BEGIN | peel, forward | peel, dial target, ack | peel, write target to service, ack |
//! | BEGIN_ACK | forward up | forward up | forward up |
//! | CONNECT | peel, forward | peel, dial service, become hidden, ack | - |
//! | DATA | peel, forward down or reseal up | peel, write to stream | peel, write to service |
//! | END | drop stream(s), forward | drop stream(s) | drop stream(s) |
//! | DESTROY | forward, delete | delete | delete |

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use ptor_crypto::{kdf, x25519};
use ptor_transport::link::{dial, Connection};
use ptor_transport::payload::{Begin, BeginAck, Connect, Created, Data, End, Extend, Record};
use ptor_transport::{Cell, Command, Link};
use ptor_types::{circuit_hex, CircuitId, StreamId, CONTROL_STREAM_ID};

use crate::pump;
use crate::repository::StateRepository;
use crate::state::{ConnState, Downstream};
use crate::{hidden_default_addr, RelayError, Result};

/// The dispatch state machine.
pub struct Engine {
    repository: Arc<StateRepository>,
    dial_timeout: Duration,
    hidden_default: String,
}

impl Engine {
    pub fn new(
        repository: Arc<StateRepository>,
        dial_timeout: Duration,
        hidden_default: String,
    ) -> Self {
        Self {
            repository,
            dial_timeout,
            hidden_default,
        }
    }

    pub fn repository(&self) -> &Arc<StateRepository> {
        &self.repository
    }

    /// Route one cell that arrived on `up`.
    pub async fn dispatch(
        self: &Arc<Self>,
        up: &Arc<Link>,
        circuit_id: CircuitId,
        cell: Cell,
    ) -> Result<()> {
        let Some(state) = self.repository.lookup(&circuit_id) else {
            return match cell.command {
                Command::End => {
                    debug!(circuit = %circuit_hex(&circuit_id), "END for unknown circuit ignored");
                    Ok(())
                }
                Command::Extend => self.handle_extend(up, &circuit_id, &cell).await,
                other => Err(RelayError::UnknownCircuit(other)),
            };
        };

        match cell.command {
            Command::Extend => self.forward_extend(&state, &circuit_id, &cell).await,
            Command::Begin => self.handle_begin(&state, &circuit_id, &cell).await,
            Command::BeginAck => self.handle_begin_ack(&state, &circuit_id, &cell).await,
            Command::Connect => self.handle_connect(&state, &circuit_id, &cell).await,
            Command::Data => self.handle_data(&state, &circuit_id, &cell).await,
            Command::End => self.handle_end(&state, &circuit_id, &cell).await,
            Command::Destroy => {
                self.handle_destroy(&state, &circuit_id, &cell).await;
                Ok(())
            }
            Command::Created => Err(RelayError::Unexpected {
                command: Command::Created,
                reason: "CREATED travels in its own frame",
            }),
        }
    }

    /// Log a failed dispatch. Authentication failures kill the circuit.
    pub async fn report_failure(
        &self,
        circuit_id: &CircuitId,
        command: Command,
        error: &RelayError,
    ) {
        let circuit = circuit_hex(circuit_id);
        if !matches!(error, RelayError::Crypto(_)) {
            warn!(%circuit, ?command, error = %error, "cell dispatch failed");
            return;
        }
        warn!(%circuit, ?command, error = %error, "authentication failure, tearing circuit down");
        if let Some(state) = self.repository.lookup(circuit_id) {
            self.notify_destroy(&state.up, circuit_id).await;
            if let Some(next) = state.next_relay() {
                self.notify_destroy(&next.link, circuit_id).await;
            }
            self.repository.delete(circuit_id);
        }
    }

    /// EXTEND on a circuit this relay has not seen: key agreement, optional
    /// dial of the next hop, CREATED back up.
    async fn handle_extend(
        &self,
        up: &Arc<Link>,
        circuit_id: &CircuitId,
        cell: &Cell,
    ) -> Result<()> {
        match self.extend(up, circuit_id, cell).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.notify_destroy(up, circuit_id).await;
                Err(e)
            }
        }
    }

    async fn extend(&self, up: &Arc<Link>, circuit_id: &CircuitId, cell: &Cell) -> Result<()> {
        let extend = Extend::from_bytes(&cell.payload)?;
        let (secret, public) = x25519::generate();
        let client = x25519::X25519PublicKey::from_bytes(extend.client_pub);
        let shared = x25519::shared(&secret, &client)?;
        let (key, base_nonce) = kdf::derive_key_nonce(shared.as_bytes());

        let down = if extend.next_hop.is_empty() {
            None
        } else {
            Some(Downstream::new(self.dial(&extend.next_hop).await?))
        };
        let role = if down.is_some() { "middle" } else { "terminal" };

        let state = ConnState::new(key, base_nonce, Arc::clone(up), down);
        self.repository.add(*circuit_id, Arc::new(state));

        let created = Created {
            relay_pub: public.to_bytes(),
        };
        up.send_created(circuit_id, &created.to_bytes()?).await?;
        info!(
            circuit = %circuit_hex(circuit_id),
            peer = %up.peer(),
            role,
            next = %extend.next_hop,
            "circuit extended"
        );
        Ok(())
    }

    /// EXTEND on an established circuit: pass it one hop further and relay
    /// the CREATED answer back up.
    async fn forward_extend(
        &self,
        state: &Arc<ConnState>,
        circuit_id: &CircuitId,
        cell: &Cell,
    ) -> Result<()> {
        let Some(next) = state.next_relay() else {
            return Err(RelayError::Unexpected {
                command: Command::Extend,
                reason: "circuit already terminates here",
            });
        };
        let exchanged = next.exchange_extend(circuit_id, cell).await;
        match exchanged {
            Ok((answered, payload)) => {
                state.up.send_created(&answered, &payload).await?;
                debug!(
                    circuit = %circuit_hex(circuit_id),
                    next = %next.link.peer(),
                    "EXTEND forwarded"
                );
                Ok(())
            }
            Err(e) => {
                self.notify_destroy(&state.up, circuit_id).await;
                self.repository.delete(circuit_id);
                Err(e)
            }
        }
    }

    /// BEGIN: peel and forward on a middle hop, dial the target on an exit.
    ///
    /// On a hidden hop every stream shares the one service connection. Only
    /// the first BEGIN starts the hidden pump, so all bytes the service sends
    /// back go up tagged with that first stream's id. Later BEGINs just write
    /// their target to the service and get acked.
    async fn handle_begin(
        self: &Arc<Self>,
        state: &Arc<ConnState>,
        circuit_id: &CircuitId,
        cell: &Cell,
    ) -> Result<()> {
        let plaintext = state.open_begin(&cell.payload).await?;

        if let Some(next) = state.next_relay() {
            self.ensure_serve_down(state, circuit_id);
            next.link
                .send_cell(circuit_id, &Cell::new(Command::Begin, plaintext))
                .await?;
            return Ok(());
        }

        let begin = Begin::from_bytes(&plaintext)?;
        let circuit = circuit_hex(circuit_id);

        if let Some(service) = state.hidden_service() {
            service.link.write_raw(begin.target.as_bytes()).await?;
            self.repository
                .add_stream(circuit_id, begin.stream_id, Arc::clone(&service.link))?;
            if state.mark_served() {
                tokio::spawn(pump::hidden_pump(
                    Arc::clone(&self.repository),
                    Arc::clone(state),
                    *circuit_id,
                    begin.stream_id,
                ));
            }
            self.ack(state, circuit_id, begin.stream_id).await?;
            debug!(%circuit, stream = begin.stream_id, "hidden stream open");
            return Ok(());
        }

        let conn = match self.dial(&begin.target).await {
            Ok(conn) => conn,
            Err(e) => {
                // One unreachable target takes the whole circuit down.
                warn!(
                    %circuit,
                    stream = begin.stream_id,
                    target = %begin.target,
                    error = %e,
                    "exit dial failed"
                );
                self.notify_destroy(&state.up, circuit_id).await;
                self.repository.delete(circuit_id);
                return Err(e);
            }
        };
        let Connection { reader, link } = conn;
        self.repository
            .add_stream(circuit_id, begin.stream_id, Arc::clone(&link))?;
        self.ack(state, circuit_id, begin.stream_id).await?;
        tokio::spawn(pump::stream_pump(
            Arc::clone(&self.repository),
            Arc::clone(state),
            *circuit_id,
            begin.stream_id,
            reader,
            link,
        ));
        info!(%circuit, stream = begin.stream_id, target = %begin.target, "exit stream open");
        Ok(())
    }

    async fn handle_begin_ack(
        &self,
        state: &Arc<ConnState>,
        circuit_id: &CircuitId,
        cell: &Cell,
    ) -> Result<()> {
        state.up.send_cell(circuit_id, cell).await?;
        Ok(())
    }

    async fn handle_connect(
        self: &Arc<Self>,
        state: &Arc<ConnState>,
        circuit_id: &CircuitId,
        cell: &Cell,
    ) -> Result<()> {
        let plaintext = state.open_begin(&cell.payload).await?;

        if let Some(next) = state.next_relay() {
            self.ensure_serve_down(state, circuit_id);
            next.link
                .send_cell(circuit_id, &Cell::new(Command::Connect, plaintext))
                .await?;
            return Ok(());
        }
        if state.is_hidden() {
            return Err(RelayError::Unexpected {
                command: Command::Connect,
                reason: "already attached to a hidden service",
            });
        }

        let connect = Connect::from_bytes(&plaintext)?;
        let target = if connect.target.is_empty() {
            hidden_default_addr(&self.hidden_default)
        } else {
            connect.target
        };
        let conn = match self.dial(&target).await {
            Ok(conn) => conn,
            Err(e) => {
                self.notify_destroy(&state.up, circuit_id).await;
                self.repository.delete(circuit_id);
                return Err(e);
            }
        };
        let hidden = state.to_hidden(Downstream::new(conn));
        self.repository.add(*circuit_id, Arc::new(hidden));
        self.ack(state, circuit_id, CONTROL_STREAM_ID).await?;
        info!(circuit = %circuit_hex(circuit_id), %target, "attached to hidden service");
        Ok(())
    }

    /// DATA from either direction. Also called by the downstream pump.
    pub async fn handle_data(
        self: &Arc<Self>,
        state: &Arc<ConnState>,
        circuit_id: &CircuitId,
        cell: &Cell,
    ) -> Result<()> {
        let plaintext = match state.open_data(&cell.payload).await {
            Ok(plaintext) => plaintext,
            Err(e) if state.is_middle() => {
                return self
                    .reseal_unopened_upstream(state, circuit_id, &cell.payload, &e)
                    .await;
            }
            Err(e) => return Err(e),
        };

        if let Some(next) = state.next_relay() {
            self.ensure_serve_down(state, circuit_id);
            next.link
                .send_cell(circuit_id, &Cell::new(Command::Data, plaintext))
                .await?;
            return Ok(());
        }

        let data = Data::from_bytes(&plaintext)?;
        if let Some(service) = state.hidden_service() {
            service.link.write_raw(&data.data).await?;
            return Ok(());
        }
        let stream = self
            .repository
            .get_stream(circuit_id, data.stream_id)
            .ok_or(RelayError::StreamNotFound(data.stream_id))?;
        stream.write_raw(&data.data).await?;
        Ok(())
    }

    /// A middle hop cannot tell DATA direction from the frame. A payload that
    /// does not open under the downstream nonce is taken to be upstream
    /// traffic sealed by deeper hops: add this hop's layer and send it up.
    /// A corrupted downstream cell ends up here too.
    async fn reseal_unopened_upstream(
        &self,
        state: &ConnState,
        circuit_id: &CircuitId,
        payload: &[u8],
        open_error: &RelayError,
    ) -> Result<()> {
        debug!(
            circuit = %circuit_hex(circuit_id),
            error = %open_error,
            "DATA did not open downstream; re-sealing upstream"
        );
        state.seal_upstream(circuit_id, payload).await
    }

    async fn handle_end(
        &self,
        state: &Arc<ConnState>,
        circuit_id: &CircuitId,
        cell: &Cell,
    ) -> Result<()> {
        let end = End::from_bytes(&cell.payload)?;
        let circuit = circuit_hex(circuit_id);

        if end.stream_id != CONTROL_STREAM_ID {
            self.repository.remove_stream(circuit_id, end.stream_id);
            if let Some(next) = state.next_relay() {
                next.link.send_cell(circuit_id, cell).await?;
            }
            debug!(%circuit, stream = end.stream_id, "stream ended");
            return Ok(());
        }

        let closed = self.repository.destroy_all_streams(circuit_id);
        if let Some(next) = state.next_relay() {
            if let Err(e) = next.link.send_cell(circuit_id, cell).await {
                debug!(%circuit, error = %e, "END not forwarded");
            }
        }
        self.repository.delete(circuit_id);
        info!(%circuit, streams = closed, "circuit ended");
        Ok(())
    }

    async fn handle_destroy(&self, state: &Arc<ConnState>, circuit_id: &CircuitId, cell: &Cell) {
        if let Some(next) = state.next_relay() {
            if let Err(e) = next.link.send_cell(circuit_id, cell).await {
                debug!(circuit = %circuit_hex(circuit_id), error = %e, "DESTROY not forwarded");
            }
        }
        self.repository.delete(circuit_id);
        info!(circuit = %circuit_hex(circuit_id), "circuit destroyed");
    }

    /// Start the downstream pump unless one already runs for this state.
    fn ensure_serve_down(self: &Arc<Self>, state: &Arc<ConnState>, circuit_id: &CircuitId) {
        if state.next_relay().is_some() && state.mark_served() {
            tokio::spawn(pump::downstream_pump(
                Arc::clone(self),
                Arc::clone(state),
                *circuit_id,
            ));
        }
    }

    async fn ack(
        &self,
        state: &ConnState,
        circuit_id: &CircuitId,
        stream_id: StreamId,
    ) -> Result<()> {
        let ack = BeginAck { stream_id };
        state
            .up
            .send_cell(circuit_id, &Cell::new(Command::BeginAck, ack.to_bytes()?))
            .await?;
        Ok(())
    }

    async fn notify_destroy(&self, link: &Link, circuit_id: &CircuitId) {
        if let Err(e) = link.send_cell(circuit_id, &Cell::empty(Command::Destroy)).await {
            debug!(
                circuit = %circuit_hex(circuit_id),
                peer = %link.peer(),
                error = %e,
                "DESTROY not delivered"
            );
        }
    }

    async fn dial(&self, addr: &str) -> Result<Connection> {
        dial(addr, self.dial_timeout)
            .await
            .map_err(|source| RelayError::Dial {
                addr: addr.to_string(),
                source,
            })
    }
}
