//! Directory records consumed during path selection and target resolution.
//!
//! The directory service itself (HTTP + JSON) lives outside this workspace;
//! these are the shapes it publishes.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// A relay listing.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Stable relay identifier.
    pub id: String,
    /// `host:port` the relay accepts circuit connections on.
    pub addr: String,
    /// Relay long-term X25519 public key.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub public_key: [u8; 32],
    /// Whether the directory currently lists the relay as online.
    #[serde(default = "default_true")]
    pub online: bool,
}

/// A hidden-service listing.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenService {
    /// Lookup address (e.g. `abcdef.ptor`).
    pub address: String,
    /// Relay that terminates circuits for this service.
    pub relay_id: String,
    /// Service public key.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub public_key: [u8; 32],
    /// Backend endpoint the owning relay dials. `None` defers to the relay's
    /// configured default.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}
