//! # ptor-transport
//!
//! Wire format and connection plumbing for ptor circuits.
//!
//! - **Cell codec** — fixed 512-byte frames via [`cell`]
//! - **Payload records** — CBOR-encoded per-command records via [`payload`]
//! - **CBOR helpers** via [`cbor`]
//! - **Circuit framing** — circuit-id prefix and the unpadded CREATED frame via [`frame`]
//! - **Links** — write halves with close signalling, and dialing, via [`link`]
//!
//! ## Layering
//!
//! ```text
//! payload record (payload.rs)  -- CBOR, possibly onion-sealed by the caller
//!     |
//!     v
//! Cell (cell.rs)               -- command + version + length + payload + random pad = 512 bytes
//!     |
//!     v
//! frame (frame.rs)             -- [circuit_id:16][cell:512]
//!     |
//!     v
//! Link (link.rs)               -- TCP (or any AsyncWrite) write half
//! ```

pub mod cbor;
pub mod cell;
pub mod frame;
pub mod link;
pub mod payload;

pub use cell::{Cell, CellError, Command};
pub use link::{Connection, Link};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Malformed cell.
    #[error("cell error: {0}")]
    Cell(#[from] CellError),

    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A frame ended before all of its bytes arrived.
    #[error("truncated frame: got {got} of {want} bytes")]
    Truncated { got: usize, want: usize },

    /// A frame carried a command the reader was not expecting.
    #[error("unexpected command: expected {expected:?}, got {got:?}")]
    UnexpectedCommand { expected: Command, got: Command },

    /// The link was closed locally.
    #[error("link closed")]
    Closed,

    /// Dial did not complete in time.
    #[error("timed out dialing {0}")]
    Timeout(String),

    /// I/O error (socket read/write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Serialization("test".to_string());
        assert_eq!(err.to_string(), "serialization error: test");

        let err = TransportError::from(CellError::InvalidCommand(0x7F));
        assert!(err.to_string().contains("0x7f"));
    }
}
