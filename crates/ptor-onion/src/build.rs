//! Telescoping circuit construction.
//!
//! The client dials hop 0 once. Every later hop is reached by sending EXTEND
//! down the same connection; each established relay forwards it one hop
//! further and relays the CREATED answer back. Hops are negotiated strictly
//! in order, each one waiting for the previous CREATED.
//!
//! ```text
//! client ──EXTEND{next=hop1}──▶ hop0                      (hop0 dials hop1)
//! client ──EXTEND{next=hop2}──▶ hop0 ──▶ hop1             (hop1 dials hop2)
//! client ──EXTEND{next=""}───▶ hop0 ──▶ hop1 ──▶ hop2     (terminal)
//! ```
//!
//! Any failure sends DESTROY on the entry connection, closes it and leaves
//! nothing in the repository.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, info, warn};

use ptor_crypto::identity::CircuitIdentity;
use ptor_crypto::{kdf, x25519};
use ptor_transport::frame::read_created;
use ptor_transport::link::{dial, BoxReader, Connection};
use ptor_transport::payload::{Created, Extend, Record};
use ptor_transport::{Cell, Command, Link};
use ptor_types::directory::RelayInfo;
use ptor_types::{circuit_hex, CircuitId, DEFAULT_CIRCUIT_HOPS};

use crate::circuit::{Circuit, EntryConnection, HopKeys};
use crate::directory::Directory;
use crate::path::select_path;
use crate::repository::CircuitRepository;
use crate::{OnionError, Result, DIAL_TIMEOUT, EXTEND_TIMEOUT};

/// Parameters of one circuit build.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub hops: usize,
    /// Relay id pinned as the last hop.
    pub exit: Option<String>,
    pub dial_timeout: Duration,
    pub extend_timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            hops: DEFAULT_CIRCUIT_HOPS,
            exit: None,
            dial_timeout: DIAL_TIMEOUT,
            extend_timeout: EXTEND_TIMEOUT,
        }
    }
}

/// Select a path, negotiate every hop and persist the resulting circuit.
pub async fn build_circuit(
    directory: &dyn Directory,
    repository: &CircuitRepository,
    options: &BuildOptions,
) -> Result<CircuitId> {
    let relays = directory.online_relays()?;
    let path = select_path(&relays, options.hops, options.exit.as_deref())?;
    build_on_path(repository, path, options).await
}

/// Negotiate an explicit, already selected path.
pub async fn build_on_path(
    repository: &CircuitRepository,
    path: Vec<RelayInfo>,
    options: &BuildOptions,
) -> Result<CircuitId> {
    let entry = path.first().ok_or(OnionError::InvalidHopCount(0))?;
    let circuit_id: CircuitId = OsRng.gen();
    let identity = CircuitIdentity::generate();
    let circuit = circuit_hex(&circuit_id);

    let Connection { mut reader, link } = dial(&entry.addr, options.dial_timeout).await?;
    debug!(%circuit, entry = %entry.id, hops = path.len(), "building circuit");

    match negotiate(&mut reader, &link, &circuit_id, &path, options.extend_timeout).await {
        Ok(keys) => {
            let relays = path.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
            let hops = path.into_iter().zip(keys).collect();
            let built = Circuit::new(
                circuit_id,
                hops,
                identity,
                EntryConnection::new(link, reader),
            )?;
            repository.add(built);
            info!(%circuit, path = ?relays, "circuit built");
            Ok(circuit_id)
        }
        Err(e) => {
            warn!(%circuit, error = %e, "circuit build failed");
            if let Err(send) = link.send_cell(&circuit_id, &Cell::empty(Command::Destroy)).await {
                debug!(%circuit, error = %send, "teardown notification not delivered");
            }
            link.shutdown().await;
            Err(e)
        }
    }
}

async fn negotiate(
    reader: &mut BoxReader,
    link: &Link,
    circuit_id: &CircuitId,
    path: &[RelayInfo],
    extend_timeout: Duration,
) -> Result<Vec<HopKeys>> {
    let mut keys = Vec::with_capacity(path.len());
    for (hop, relay) in path.iter().enumerate() {
        let next_hop = path.get(hop + 1).map(|r| r.addr.clone()).unwrap_or_default();
        let exchange = extend_hop(reader, link, circuit_id, hop, next_hop);
        let hop_keys = tokio::time::timeout(extend_timeout, exchange)
            .await
            .map_err(|_| OnionError::Timeout(format!("EXTEND to hop {hop} ({})", relay.id)))??;
        debug!(circuit = %circuit_hex(circuit_id), hop, relay = %relay.id, "hop negotiated");
        keys.push(hop_keys);
    }
    Ok(keys)
}

/// One EXTEND/CREATED round trip with a fresh ephemeral key.
async fn extend_hop(
    reader: &mut BoxReader,
    link: &Link,
    circuit_id: &CircuitId,
    hop: usize,
    next_hop: String,
) -> Result<HopKeys> {
    let (secret, public) = x25519::generate();
    let extend = Extend {
        next_hop,
        client_pub: public.to_bytes(),
    };
    link.send_cell(circuit_id, &Cell::new(Command::Extend, extend.to_bytes()?))
        .await?;

    let (answered, payload) = read_created(reader).await?;
    if &answered != circuit_id {
        return Err(OnionError::Handshake {
            hop,
            reason: "CREATED for a different circuit".to_string(),
        });
    }
    let created = Created::from_bytes(&payload)?;
    let shared = x25519::shared(&secret, &x25519::X25519PublicKey::from_bytes(created.relay_pub))?;
    let (key, base_nonce) = kdf::derive_key_nonce(shared.as_bytes());
    Ok(HopKeys { key, base_nonce })
}
