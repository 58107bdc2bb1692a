//! # ptor-onion
//!
//! Client side of ptor onion routing.
//!
//! - [`circuit`] - Circuit entity: per-hop keys, base nonces, counters, streams
//! - [`repository`] - Lock-guarded store of built circuits
//! - [`path`] - Uniform random relay selection
//! - [`directory`] - Directory lookup trait and an in-memory listing
//! - [`build`] - Telescoping circuit construction over one connection
//! - [`client`] - Stream operations on built circuits
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Default hops | 3 |
//! | Maximum hops | 5 |
//! | Entry dial deadline | 10 s |
//! | Per-hop EXTEND deadline | 10 s |
//! | Key derivation contexts | `ptor v1 hop-{key,nonce}` |

use std::time::Duration;

pub mod build;
pub mod circuit;
pub mod client;
pub mod directory;
pub mod path;
pub mod repository;

/// Deadline for the single dial to the first hop.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for one EXTEND/CREATED exchange while building.
pub const EXTEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Error types for client onion operations.
#[derive(Debug, thiserror::Error)]
pub enum OnionError {
    /// Not enough online relays to build the requested path.
    #[error("insufficient relays: need {need}, have {have}")]
    InsufficientRelays { need: usize, have: usize },

    /// Requested hop count outside 1..=MAX_CIRCUIT_HOPS.
    #[error("invalid hop count {0}")]
    InvalidHopCount(usize),

    /// Requested exit relay is unknown or offline.
    #[error("exit relay {0} is not online")]
    ExitUnavailable(String),

    /// Hidden-service address not listed.
    #[error("hidden service {0} not found")]
    HiddenServiceNotFound(String),

    /// Directory lookup failed.
    #[error("directory error: {0}")]
    Directory(String),

    /// No circuit with this id in the repository.
    #[error("circuit not found")]
    CircuitNotFound,

    /// Circuit keys were wiped; the circuit is dead.
    #[error("circuit keys wiped")]
    CircuitWiped,

    /// Hop index out of range.
    #[error("hop {hop} out of range for {hops}-hop circuit")]
    HopOutOfRange { hop: usize, hops: usize },

    /// Handshake with a hop failed.
    #[error("handshake with hop {hop} failed: {reason}")]
    Handshake { hop: usize, reason: String },

    /// The circuit was torn down by the network.
    #[error("circuit destroyed")]
    CircuitDestroyed,

    /// Stream id not open on this circuit.
    #[error("stream {0} not open")]
    StreamNotOpen(u16),

    /// A deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("stream table error: {0}")]
    Stream(#[from] ptor_types::stream::StreamError),

    #[error("crypto error: {0}")]
    Crypto(#[from] ptor_crypto::CryptoError),

    #[error("transport error: {0}")]
    Transport(#[from] ptor_transport::TransportError),
}

/// Convenience result type for client onion operations.
pub type Result<T> = std::result::Result<T, OnionError>;
