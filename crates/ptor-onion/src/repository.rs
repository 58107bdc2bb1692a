//! Store of built circuits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use ptor_types::CircuitId;

use crate::circuit::Circuit;
use crate::{OnionError, Result};

/// Shared handle to one circuit.
pub type CircuitHandle = Arc<Mutex<Circuit>>;

/// Circuits keyed by id. The map lock is never held across an await.
#[derive(Default)]
pub struct CircuitRepository {
    circuits: StdMutex<HashMap<CircuitId, CircuitHandle>>,
}

impl CircuitRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<CircuitId, CircuitHandle>> {
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a circuit, replacing any previous entry with the same id.
    pub fn add(&self, circuit: Circuit) -> CircuitHandle {
        let id = *circuit.id();
        let handle = Arc::new(Mutex::new(circuit));
        self.map().insert(id, Arc::clone(&handle));
        handle
    }

    pub fn find(&self, id: &CircuitId) -> Result<CircuitHandle> {
        self.map().get(id).cloned().ok_or(OnionError::CircuitNotFound)
    }

    pub fn remove(&self, id: &CircuitId) -> Option<CircuitHandle> {
        self.map().remove(id)
    }

    pub fn ids(&self) -> Vec<CircuitId> {
        self.map().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
