//! Fixed-size cell codec.
//!
//! ## Wire format
//!
//! ```text
//! [command:1][version:1][length:2 BE][payload:length][random padding] = 512 bytes
//! ```

use rand::RngCore;

/// Encoded cell size in bytes.
pub const CELL_SIZE: usize = 512;

/// Command + version + length.
pub const CELL_HEADER_SIZE: usize = 4;

/// Largest payload a cell can carry.
pub const MAX_PAYLOAD_SIZE: usize = CELL_SIZE - CELL_HEADER_SIZE; // 508

/// The only supported protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Cell commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Extend = 0x01,
    Connect = 0x02,
    Data = 0x03,
    End = 0x04,
    Destroy = 0x05,
    Begin = 0x06,
    BeginAck = 0x07,
    Created = 0x08,
}

impl Command {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = CellError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Command::Extend,
            0x02 => Command::Connect,
            0x03 => Command::Data,
            0x04 => Command::End,
            0x05 => Command::Destroy,
            0x06 => Command::Begin,
            0x07 => Command::BeginAck,
            0x08 => Command::Created,
            other => return Err(CellError::InvalidCommand(other)),
        })
    }
}

/// Cell framing errors. Always fatal to the connection that produced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("invalid cell length {0}, expected {CELL_SIZE}")]
    InvalidLength(usize),

    #[error("invalid command byte {0:#04x}")]
    InvalidCommand(u8),

    #[error("unsupported version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("declared payload length {0} exceeds {MAX_PAYLOAD_SIZE}")]
    InvalidPayloadLength(usize),

    #[error("payload of {0} bytes does not fit in a cell")]
    PayloadTooLarge(usize),
}

/// One protocol cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub command: Command,
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Cell {
    /// Create a cell at the current protocol version.
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self {
            command,
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Create a cell with no payload.
    pub fn empty(command: Command) -> Self {
        Self::new(command, Vec::new())
    }

    /// Encode into exactly [`CELL_SIZE`] bytes, padding with random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn encode(&self) -> Result<[u8; CELL_SIZE], CellError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(CellError::PayloadTooLarge(len));
        }
        let mut buf = [0u8; CELL_SIZE];
        buf[0] = self.command.as_u8();
        buf[1] = self.version;
        // len <= 508, fits in u16
        buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        let end = CELL_HEADER_SIZE + len;
        buf[CELL_HEADER_SIZE..end].copy_from_slice(&self.payload);
        rand::thread_rng().fill_bytes(&mut buf[end..]);
        Ok(buf)
    }

    /// Decode a 512-byte buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, CellError> {
        if buf.len() != CELL_SIZE {
            return Err(CellError::InvalidLength(buf.len()));
        }
        let command = Command::try_from(buf[0])?;
        let version = buf[1];
        if version != PROTOCOL_VERSION {
            return Err(CellError::UnsupportedVersion(version));
        }
        let len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if len > MAX_PAYLOAD_SIZE {
            return Err(CellError::InvalidPayloadLength(len));
        }
        Ok(Self {
            command,
            version,
            payload: buf[CELL_HEADER_SIZE..CELL_HEADER_SIZE + len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Command; 8] = [
        Command::Extend,
        Command::Connect,
        Command::Data,
        Command::End,
        Command::Destroy,
        Command::Begin,
        Command::BeginAck,
        Command::Created,
    ];

    #[test]
    fn test_roundtrip_every_command() {
        for (i, command) in ALL.into_iter().enumerate() {
            let cell = Cell::new(command, vec![i as u8; i * 60]);
            let encoded = cell.encode().expect("encode");
            assert_eq!(encoded.len(), CELL_SIZE);
            assert_eq!(Cell::decode(&encoded).expect("decode"), cell);
        }
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let cell = Cell::new(Command::Data, vec![0xEE; MAX_PAYLOAD_SIZE]);
        let decoded = Cell::decode(&cell.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cell = Cell::new(Command::Data, vec![0; MAX_PAYLOAD_SIZE + 1]);
        assert_eq!(cell.encode(), Err(CellError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1)));
    }

    #[test]
    fn test_header_layout() {
        let encoded = Cell::new(Command::Begin, vec![1, 2, 3]).encode().expect("encode");
        assert_eq!(encoded[0], 0x06);
        assert_eq!(encoded[1], PROTOCOL_VERSION);
        assert_eq!(&encoded[2..4], &[0, 3]);
        assert_eq!(&encoded[4..7], &[1, 2, 3]);
    }

    #[test]
    fn test_padding_is_random() {
        let cell = Cell::empty(Command::Destroy);
        let a = cell.encode().expect("encode");
        let b = cell.encode().expect("encode");
        assert_eq!(a[..CELL_HEADER_SIZE], b[..CELL_HEADER_SIZE]);
        assert_ne!(a[CELL_HEADER_SIZE..], b[CELL_HEADER_SIZE..]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        for len in [0, 1, CELL_SIZE - 1, CELL_SIZE + 1, 1024] {
            assert_eq!(Cell::decode(&vec![0x01; len]), Err(CellError::InvalidLength(len)));
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut buf = Cell::empty(Command::End).encode().expect("encode");
        for bad in [0x00, 0x09, 0xFF] {
            buf[0] = bad;
            assert_eq!(Cell::decode(&buf), Err(CellError::InvalidCommand(bad)));
        }
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut buf = Cell::empty(Command::End).encode().expect("encode");
        buf[1] = 0x02;
        assert_eq!(Cell::decode(&buf), Err(CellError::UnsupportedVersion(0x02)));
    }

    #[test]
    fn test_declared_length_too_large() {
        let mut buf = Cell::empty(Command::Data).encode().expect("encode");
        buf[2..4].copy_from_slice(&509u16.to_be_bytes());
        assert_eq!(Cell::decode(&buf), Err(CellError::InvalidPayloadLength(509)));
    }
}
