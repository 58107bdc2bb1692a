//! Read loops feeding cells and bytes back up a circuit.
//!
//! - [`downstream_pump`] reads the next relay's connection of a middle hop.
//! - [`stream_pump`] reads an exit stream's target connection.
//! - [`hidden_pump`] reads the hidden-service connection of a hidden hop.
//!
//! Every pump stops when its connection closes, errors or hits EOF. Stream
//! pumps send END for their stream on the way out. Each cell or chunk a pump
//! moves refreshes the circuit's expiry.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use ptor_crypto::onion;
use ptor_transport::frame::read_frame;
use ptor_transport::link::BoxReader;
use ptor_transport::payload::{self, End, Record};
use ptor_transport::{Cell, Command, Link};
use ptor_types::{circuit_hex, CircuitId, StreamId, CONTROL_STREAM_ID, MAX_CIRCUIT_HOPS};

use crate::engine::Engine;
use crate::repository::StateRepository;
use crate::state::ConnState;
use crate::RelayError;

/// Largest stream chunk that still fits a cell after every hop of the
/// longest circuit has added its layer.
pub fn upstream_chunk() -> usize {
    payload::max_data_chunk(onion::overhead(MAX_CIRCUIT_HOPS))
}

/// Serve cells coming back from the next relay of a middle hop.
pub async fn downstream_pump(engine: Arc<Engine>, state: Arc<ConnState>, circuit_id: CircuitId) {
    let circuit = circuit_hex(&circuit_id);
    let Some(next) = state.next_relay() else {
        return;
    };
    let Some(mut reader) = next.take_reader().await else {
        warn!(%circuit, "downstream reader already taken");
        return;
    };
    debug!(%circuit, next = %next.link.peer(), "downstream pump started");

    let mut destroyed = false;
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = next.link.closed() => {
                destroyed = true;
                break;
            }
        };
        let (id, cell) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(%circuit, error = %e, "bad frame from downstream");
                break;
            }
        };
        if id != circuit_id {
            warn!(%circuit, other = %circuit_hex(&id), "downstream frame for foreign circuit");
            continue;
        }
        engine.repository().touch(&circuit_id);

        let result = match cell.command {
            Command::Data => engine.handle_data(&state, &circuit_id, &cell).await,
            Command::BeginAck | Command::End => state
                .up
                .send_cell(&circuit_id, &cell)
                .await
                .map_err(RelayError::from),
            Command::Destroy => {
                if let Err(e) = state.up.send_cell(&circuit_id, &cell).await {
                    debug!(%circuit, error = %e, "DESTROY not forwarded upstream");
                }
                engine.repository().delete(&circuit_id);
                destroyed = true;
                break;
            }
            other => {
                debug!(%circuit, command = ?other, "ignoring cell from downstream");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(%circuit, command = ?cell.command, error = %e, "downstream cell failed");
        }
    }

    if !destroyed {
        send_end(&state, &circuit_id, CONTROL_STREAM_ID).await;
    }
    debug!(%circuit, "downstream pump finished");
}

/// Copy bytes from an exit stream's target up the circuit as DATA.
pub async fn stream_pump(
    repository: Arc<StateRepository>,
    state: Arc<ConnState>,
    circuit_id: CircuitId,
    stream_id: StreamId,
    mut reader: BoxReader,
    link: Arc<Link>,
) {
    let circuit = circuit_hex(&circuit_id);
    debug!(%circuit, stream = stream_id, "stream pump started");

    let mut buf = vec![0u8; upstream_chunk()];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = link.closed() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                repository.touch(&circuit_id);
                if let Err(e) = state.send_stream_data(&circuit_id, stream_id, &buf[..n]).await {
                    debug!(%circuit, stream = stream_id, error = %e, "upstream send failed");
                    break;
                }
            }
            Err(e) => {
                debug!(%circuit, stream = stream_id, error = %e, "stream read failed");
                break;
            }
        }
    }

    send_end(&state, &circuit_id, stream_id).await;
    repository.remove_stream(&circuit_id, stream_id);
    debug!(%circuit, stream = stream_id, "stream pump finished");
}

/// Pump the hidden-service connection of a hidden hop for `stream_id`.
pub async fn hidden_pump(
    repository: Arc<StateRepository>,
    state: Arc<ConnState>,
    circuit_id: CircuitId,
    stream_id: StreamId,
) {
    let Some(service) = state.hidden_service() else {
        return;
    };
    let Some(reader) = service.take_reader().await else {
        warn!(circuit = %circuit_hex(&circuit_id), "hidden-service reader already taken");
        return;
    };
    let link = Arc::clone(&service.link);
    stream_pump(repository, Arc::clone(&state), circuit_id, stream_id, reader, link).await;
}

async fn send_end(state: &ConnState, circuit_id: &CircuitId, stream_id: StreamId) {
    if state.up.is_closed() {
        return;
    }
    let cell = match (End { stream_id }).to_bytes() {
        Ok(payload) => Cell::new(Command::End, payload),
        Err(e) => {
            warn!(error = %e, "END encoding failed");
            return;
        }
    };
    if let Err(e) = state.up.send_cell(circuit_id, &cell).await {
        debug!(
            circuit = %circuit_hex(circuit_id),
            stream = stream_id,
            error = %e,
            "END not delivered"
        );
    }
}
