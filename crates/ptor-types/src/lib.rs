//! # ptor-types
//!
//! Shared domain types used across the ptor workspace.
//!
//! - [`directory`] - Relay and hidden-service listings as read from the directory
//! - [`stream`] - Per-circuit stream table shared by the client and the relay

pub mod directory;
pub mod stream;

/// 128-bit circuit identifier, carried raw in front of every cell on the wire.
pub type CircuitId = [u8; 16];

/// 16-bit stream identifier, unique within one circuit.
pub type StreamId = u16;

/// Stream id reserved for circuit-wide control signals. Never allocated.
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Default number of hops in a client circuit.
pub const DEFAULT_CIRCUIT_HOPS: usize = 3;

/// Largest circuit the client will build. Bounded by onion overhead per cell.
pub const MAX_CIRCUIT_HOPS: usize = 5;

/// Render a circuit id for log fields.
pub fn circuit_hex(id: &CircuitId) -> String {
    hex::encode(id)
}
