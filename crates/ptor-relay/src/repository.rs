//! TTL store of relay circuit states.
//!
//! Every entry carries its `ConnState`, a last-used instant and the circuit's
//! stream table, all under one lock so deleting a circuit and closing its
//! streams happen together. `add` and `find`/`lookup` refresh the last-used
//! instant. A sweep task started with the repository removes entries idle
//! longer than the TTL; [`StateRepository::shutdown`] stops it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use ptor_transport::Link;
use ptor_types::stream::StreamTable;
use ptor_types::{circuit_hex, CircuitId, StreamId};

use crate::state::{close_link, ConnState};
use crate::{RelayError, Result};

/// Shortest sweep interval.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Entry {
    state: Arc<ConnState>,
    last_used: Instant,
    streams: StreamTable<Arc<Link>>,
}

type StateMap = HashMap<CircuitId, Entry>;

/// Relay state store with sliding expiration.
pub struct StateRepository {
    entries: Arc<Mutex<StateMap>>,
    ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn lock(entries: &Mutex<StateMap>) -> MutexGuard<'_, StateMap> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

fn close_entry(mut entry: Entry) {
    entry.state.close();
    for (_, link) in entry.streams.drain_all() {
        close_link(&link);
    }
}

impl StateRepository {
    /// Create the repository and start its sweep task. Must be called
    /// inside a Tokio runtime.
    pub fn new(ttl: Duration) -> Self {
        let entries = Arc::new(Mutex::new(StateMap::new()));
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&entries), ttl));
        Self {
            entries,
            ttl,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace a circuit state. A replaced state keeps the
    /// circuit's stream table.
    pub fn add(&self, circuit_id: CircuitId, state: Arc<ConnState>) {
        let mut map = lock(&self.entries);
        let now = Instant::now();
        match map.get_mut(&circuit_id) {
            Some(entry) => {
                entry.state = state;
                entry.last_used = now;
            }
            None => {
                map.insert(
                    circuit_id,
                    Entry {
                        state,
                        last_used: now,
                        streams: StreamTable::new(),
                    },
                );
            }
        }
    }

    /// State for a circuit, refreshing its expiry. `None` when unknown or
    /// already idle past the TTL.
    pub fn lookup(&self, circuit_id: &CircuitId) -> Option<Arc<ConnState>> {
        let expired = {
            let mut map = lock(&self.entries);
            let now = Instant::now();
            match map.get_mut(circuit_id) {
                None => return None,
                Some(entry) if now.duration_since(entry.last_used) <= self.ttl => {
                    entry.last_used = now;
                    return Some(Arc::clone(&entry.state));
                }
                Some(_) => map.remove(circuit_id),
            }
        };
        if let Some(entry) = expired {
            debug!(circuit = %circuit_hex(circuit_id), "state expired on lookup");
            close_entry(entry);
        }
        None
    }

    /// Like [`lookup`](Self::lookup), for callers that require the state.
    pub fn find(&self, circuit_id: &CircuitId) -> Result<Arc<ConnState>> {
        self.lookup(circuit_id).ok_or(RelayError::StateNotFound)
    }

    /// Refresh the last-used instant without fetching the state. Used by
    /// the pumps for traffic flowing back towards the client. Returns false
    /// when the circuit is unknown or already idle past the TTL.
    pub fn touch(&self, circuit_id: &CircuitId) -> bool {
        let mut map = lock(&self.entries);
        let now = Instant::now();
        match map.get_mut(circuit_id) {
            Some(entry) if now.duration_since(entry.last_used) <= self.ttl => {
                entry.last_used = now;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, circuit_id: &CircuitId) -> bool {
        lock(&self.entries).contains_key(circuit_id)
    }

    /// Close the state's links and streams, then remove it.
    pub fn delete(&self, circuit_id: &CircuitId) -> bool {
        let removed = lock(&self.entries).remove(circuit_id);
        match removed {
            Some(entry) => {
                debug!(circuit = %circuit_hex(circuit_id), "state deleted");
                close_entry(entry);
                true
            }
            None => false,
        }
    }

    /// Register a connection under a client-chosen stream id. A connection
    /// already registered under that id is closed.
    pub fn add_stream(
        &self,
        circuit_id: &CircuitId,
        stream_id: StreamId,
        link: Arc<Link>,
    ) -> Result<()> {
        let replaced = {
            let mut map = lock(&self.entries);
            let entry = map.get_mut(circuit_id).ok_or(RelayError::StateNotFound)?;
            entry.streams.register(stream_id, link)?
        };
        if let Some(old) = replaced {
            close_link(&old);
        }
        Ok(())
    }

    pub fn get_stream(&self, circuit_id: &CircuitId, stream_id: StreamId) -> Option<Arc<Link>> {
        lock(&self.entries)
            .get(circuit_id)
            .and_then(|e| e.streams.get(stream_id).cloned())
    }

    /// Close and forget one stream. Returns false if it was not registered.
    pub fn remove_stream(&self, circuit_id: &CircuitId, stream_id: StreamId) -> bool {
        let removed = lock(&self.entries)
            .get_mut(circuit_id)
            .and_then(|e| e.streams.remove(stream_id));
        match removed {
            Some(link) => {
                close_link(&link);
                true
            }
            None => false,
        }
    }

    /// Close every stream of a circuit. Returns how many were closed.
    pub fn destroy_all_streams(&self, circuit_id: &CircuitId) -> usize {
        let drained = lock(&self.entries)
            .get_mut(circuit_id)
            .map(|e| e.streams.drain_all())
            .unwrap_or_default();
        for (_, link) in &drained {
            close_link(link);
        }
        drained.len()
    }

    pub fn stream_ids(&self, circuit_id: &CircuitId) -> Vec<StreamId> {
        lock(&self.entries)
            .get(circuit_id)
            .map(|e| e.streams.ids())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Remove every entry idle longer than the TTL. Returns how many.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, self.ttl)
    }

    /// Stop the sweep task and close every remaining state.
    pub fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
        let drained: Vec<Entry> = lock(&self.entries).drain().map(|(_, e)| e).collect();
        for entry in drained {
            close_entry(entry);
        }
    }
}

impl Drop for StateRepository {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
    }
}

fn sweep_expired(entries: &Mutex<StateMap>, ttl: Duration) -> usize {
    let now = Instant::now();
    let expired: Vec<(CircuitId, Entry)> = {
        let mut map = lock(entries);
        let ids: Vec<CircuitId> = map
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) > ttl)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| map.remove(&id).map(|e| (id, e)))
            .collect()
    };
    let count = expired.len();
    for (id, entry) in expired {
        debug!(circuit = %circuit_hex(&id), "state expired");
        close_entry(entry);
    }
    count
}

async fn sweep_loop(entries: std::sync::Weak<Mutex<StateMap>>, ttl: Duration) {
    let mut ticker = tokio::time::interval((ttl / 2).max(MIN_SWEEP_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            break;
        };
        let removed = sweep_expired(&entries, ttl);
        if removed > 0 {
            info!(removed, "expired relay states swept");
        }
    }
}
