//! # ptor-relay
//!
//! Relay side of ptor onion routing.
//!
//! - [`state`] - Per-circuit relay state (`ConnState`)
//! - [`repository`] - TTL store of relay states with per-circuit stream tables
//! - [`engine`] - Cell-dispatch state machine, one method per command
//! - [`pump`] - Downstream, stream and hidden-service read loops
//! - [`server`] - Accept loop serving one task per connection
//!
//! ## Circuit states at one relay
//!
//! ```text
//! UNKNOWN ──EXTEND──▶ EXTENDED ──CONNECT (terminal)──▶ HIDDEN
//!                        │                                │
//!                        └──── DESTROY / END 0 / TTL ─────┴──▶ removed
//! ```

use std::time::Duration;

use ptor_transport::Command;

pub mod engine;
pub mod pump;
pub mod repository;
pub mod server;
pub mod state;

/// Default idle lifetime of a relay circuit state.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(600);

/// Default deadline when dialing a next hop, exit target or hidden service.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback hidden-service address when CONNECT names none.
pub const DEFAULT_HIDDEN_ADDR: &str = "hidden:5000";

/// Environment variables consulted, in order, for the hidden-service address.
pub const HIDDEN_ADDR_VARS: [&str; 2] = ["PTOR_HIDDEN_ADDR", "HIDDEN_ADDR"];

/// Error types for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No state for a circuit an operation expected to exist.
    #[error("relay state not found")]
    StateNotFound,

    /// A cell other than EXTEND or END arrived for a circuit with no state.
    #[error("{0:?} for unknown circuit")]
    UnknownCircuit(Command),

    /// A command that makes no sense in the circuit's current state.
    #[error("unexpected {command:?}: {reason}")]
    Unexpected { command: Command, reason: &'static str },

    /// Forward-EXTEND needs the downstream reader but a pump owns it.
    #[error("downstream reader owned by pump")]
    ReaderBusy,

    /// No stream registered under this id.
    #[error("stream {0} not found")]
    StreamNotFound(u16),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        source: ptor_transport::TransportError,
    },

    #[error("stream table error: {0}")]
    Stream(#[from] ptor_types::stream::StreamError),

    #[error("crypto error: {0}")]
    Crypto(#[from] ptor_crypto::CryptoError),

    #[error("transport error: {0}")]
    Transport(#[from] ptor_transport::TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay runtime settings.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub state_ttl: Duration,
    pub dial_timeout: Duration,
    /// Used when CONNECT carries an empty target and no env var is set.
    pub hidden_default: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7000".to_string(),
            state_ttl: DEFAULT_STATE_TTL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            hidden_default: DEFAULT_HIDDEN_ADDR.to_string(),
        }
    }
}

/// Hidden-service address: `PTOR_HIDDEN_ADDR`, then `HIDDEN_ADDR`, then
/// `configured`.
pub fn hidden_default_addr(configured: &str) -> String {
    resolve_hidden_addr(|name| std::env::var(name).ok(), configured)
}

fn resolve_hidden_addr(lookup: impl Fn(&str) -> Option<String>, configured: &str) -> String {
    HIDDEN_ADDR_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| configured.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_addr_precedence() {
        let none = |_: &str| None;
        assert_eq!(resolve_hidden_addr(none, "hidden:5000"), "hidden:5000");

        let legacy = |name: &str| (name == "HIDDEN_ADDR").then(|| "legacy:1".to_string());
        assert_eq!(resolve_hidden_addr(legacy, "hidden:5000"), "legacy:1");

        let both = |name: &str| Some(format!("{name}:1"));
        assert_eq!(resolve_hidden_addr(both, "hidden:5000"), "PTOR_HIDDEN_ADDR:1");

        let empty = |name: &str| (name == "PTOR_HIDDEN_ADDR").then(String::new);
        assert_eq!(resolve_hidden_addr(empty, "cfg:9"), "cfg:9");
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.state_ttl, Duration::from_secs(600));
        assert_eq!(config.hidden_default, "hidden:5000");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            RelayError::UnknownCircuit(Command::Data).to_string(),
            "Data for unknown circuit"
        );
        assert_eq!(RelayError::StreamNotFound(4).to_string(), "stream 4 not found");
    }
}
