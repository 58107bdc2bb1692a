//! Per-circuit stream table.
//!
//! The client keeps one of these inside each circuit and allocates ids from
//! it; the relay keeps one per circuit and registers connections under the
//! id the client chose. Id 0 is reserved for circuit control on both sides.

use std::collections::HashMap;

use crate::{StreamId, CONTROL_STREAM_ID};

/// Stream table errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Stream id 0 cannot name a real stream.
    #[error("stream id 0 is reserved for circuit control")]
    ReservedId,

    /// Every non-zero id is in use.
    #[error("stream ids exhausted")]
    Exhausted,
}

/// Stream id to value mapping with id allocation.
#[derive(Debug)]
pub struct StreamTable<T> {
    entries: HashMap<StreamId, T>,
    next_id: StreamId,
}

impl<T> StreamTable<T> {
    /// Create an empty table. The first allocated id is 1.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate a fresh id for `value`.
    pub fn allocate(&mut self, value: T) -> Result<StreamId, StreamError> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                CONTROL_STREAM_ID => 1,
                n => n,
            };
            if !self.entries.contains_key(&id) {
                self.entries.insert(id, value);
                return Ok(id);
            }
        }
        Err(StreamError::Exhausted)
    }

    /// Register `value` under an externally chosen id.
    ///
    /// Returns the value previously registered under `id`, if any, so the
    /// caller can release it.
    pub fn register(&mut self, id: StreamId, value: T) -> Result<Option<T>, StreamError> {
        if id == CONTROL_STREAM_ID {
            return Err(StreamError::ReservedId);
        }
        Ok(self.entries.insert(id, value))
    }

    pub fn get(&self, id: StreamId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<T> {
        self.entries.remove(&id)
    }

    /// All registered ids in ascending order.
    pub fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids whose value satisfies `pred`, ascending.
    pub fn ids_where(&self, pred: impl Fn(&T) -> bool) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .entries
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and return every entry.
    pub fn drain_all(&mut self) -> Vec<(StreamId, T)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for StreamTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
