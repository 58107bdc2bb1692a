//! Directory lookups used by the client.
//!
//! The client only needs two things from a directory: the set of online
//! relays and the owner of a hidden-service address. [`StaticDirectory`] is
//! an in-memory listing fed by whoever embeds the client.

use std::collections::HashMap;
use std::sync::RwLock;

use ptor_types::directory::{HiddenService, RelayInfo};

use crate::{OnionError, Result};

/// Source of relay and hidden-service listings.
pub trait Directory: Send + Sync {
    /// All relays currently marked online.
    fn online_relays(&self) -> Result<Vec<RelayInfo>>;

    /// Look up one relay by id.
    fn relay(&self, id: &str) -> Result<Option<RelayInfo>>;

    /// Look up the relay owning a hidden-service address.
    fn hidden_service(&self, address: &str) -> Result<HiddenService>;
}

/// In-memory directory.
#[derive(Default)]
pub struct StaticDirectory {
    relays: RwLock<Vec<RelayInfo>>,
    hidden: RwLock<HashMap<String, HiddenService>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a relay list.
    pub fn from_relays(relays: Vec<RelayInfo>) -> Self {
        Self {
            relays: RwLock::new(relays),
            hidden: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a relay by id.
    pub fn add_relay(&self, relay: RelayInfo) -> Result<()> {
        let mut relays = self.relays.write().map_err(|_| poisoned())?;
        if let Some(existing) = relays.iter_mut().find(|r| r.id == relay.id) {
            *existing = relay;
        } else {
            relays.push(relay);
        }
        Ok(())
    }

    /// Flip a relay's online flag. Returns false for unknown ids.
    pub fn set_online(&self, id: &str, online: bool) -> Result<bool> {
        let mut relays = self.relays.write().map_err(|_| poisoned())?;
        Ok(match relays.iter_mut().find(|r| r.id == id) {
            Some(relay) => {
                relay.online = online;
                true
            }
            None => false,
        })
    }

    /// Register a hidden service under its address.
    pub fn add_hidden_service(&self, service: HiddenService) -> Result<()> {
        let mut hidden = self.hidden.write().map_err(|_| poisoned())?;
        hidden.insert(service.address.clone(), service);
        Ok(())
    }
}

fn poisoned() -> OnionError {
    OnionError::Directory("lock poisoned".to_string())
}

impl Directory for StaticDirectory {
    fn online_relays(&self) -> Result<Vec<RelayInfo>> {
        let relays = self.relays.read().map_err(|_| poisoned())?;
        Ok(relays.iter().filter(|r| r.online).cloned().collect())
    }

    fn relay(&self, id: &str) -> Result<Option<RelayInfo>> {
        let relays = self.relays.read().map_err(|_| poisoned())?;
        Ok(relays.iter().find(|r| r.id == id).cloned())
    }

    fn hidden_service(&self, address: &str) -> Result<HiddenService> {
        let hidden = self.hidden.read().map_err(|_| poisoned())?;
        hidden
            .get(address)
            .cloned()
            .ok_or_else(|| OnionError::HiddenServiceNotFound(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: &str) -> RelayInfo {
        RelayInfo {
            id: id.to_string(),
            addr: "127.0.0.1:7000".to_string(),
            public_key: [1u8; 32],
            online: true,
        }
    }

    #[test]
    fn test_online_filter() {
        let dir = StaticDirectory::from_relays(vec![relay("a"), relay("b")]);
        assert_eq!(dir.online_relays().expect("relays").len(), 2);
        assert!(dir.set_online("a", false).expect("set"));
        assert!(!dir.set_online("zzz", false).expect("set"));
        let online = dir.online_relays().expect("relays");
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, "b");
        assert!(dir.relay("a").expect("lookup").is_some());
    }

    #[test]
    fn test_add_relay_replaces() {
        let dir = StaticDirectory::new();
        dir.add_relay(relay("a")).expect("add");
        let mut updated = relay("a");
        updated.addr = "10.0.0.1:7000".to_string();
        dir.add_relay(updated).expect("add");
        let relays = dir.online_relays().expect("relays");
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].addr, "10.0.0.1:7000");
    }

    #[test]
    fn test_hidden_service_lookup() {
        let dir = StaticDirectory::new();
        dir.add_hidden_service(HiddenService {
            address: "shop.ptor".to_string(),
            relay_id: "a".to_string(),
            public_key: [2u8; 32],
            endpoint: None,
        })
        .expect("add");
        assert_eq!(dir.hidden_service("shop.ptor").expect("found").relay_id, "a");
        assert!(matches!(
            dir.hidden_service("nope.ptor"),
            Err(OnionError::HiddenServiceNotFound(_))
        ));
    }
}
