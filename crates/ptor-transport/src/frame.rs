//! Circuit framing.
//!
//! Every message on a circuit connection is `[circuit_id:16][cell:512]`,
//! except CREATED, which travels as an unpadded frame:
//!
//! ```text
//! [circuit_id:16][command:1][version:1][length:2 BE][payload:length]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};

use ptor_types::CircuitId;

use crate::cell::{Cell, CellError, Command, CELL_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::{Result, TransportError};

/// Size of the circuit id prefix.
pub const CIRCUIT_ID_SIZE: usize = 16;

/// Size of a regular frame.
pub const FRAME_SIZE: usize = CIRCUIT_ID_SIZE + CELL_SIZE;

/// Size of the CREATED frame header.
pub const CREATED_HEADER_SIZE: usize = CIRCUIT_ID_SIZE + 4; // 20

/// Encode a regular frame.
pub fn encode_frame(circuit_id: &CircuitId, cell: &Cell) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(FRAME_SIZE);
    buf.extend_from_slice(circuit_id);
    buf.extend_from_slice(&cell.encode()?);
    Ok(buf)
}

/// Encode an unpadded CREATED frame.
pub fn encode_created(circuit_id: &CircuitId, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CellError::PayloadTooLarge(payload.len()).into());
    }
    let mut buf = Vec::with_capacity(CREATED_HEADER_SIZE + payload.len());
    buf.extend_from_slice(circuit_id);
    buf.push(Command::Created.as_u8());
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Fill `buf` completely. `Ok(false)` means the stream ended before the
/// first byte.
async fn fill<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut got = 0;
    while got < buf.len() {
        let n = reader.read(&mut buf[got..]).await?;
        if n == 0 {
            if got == 0 {
                return Ok(false);
            }
            return Err(TransportError::Truncated {
                got,
                want: buf.len(),
            });
        }
        got += n;
    }
    Ok(true)
}

/// Read one regular frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Option<(CircuitId, Cell)>> {
    let mut buf = [0u8; FRAME_SIZE];
    if !fill(reader, &mut buf).await? {
        return Ok(None);
    }
    let mut circuit_id = [0u8; CIRCUIT_ID_SIZE];
    circuit_id.copy_from_slice(&buf[..CIRCUIT_ID_SIZE]);
    let cell = Cell::decode(&buf[CIRCUIT_ID_SIZE..])?;
    Ok(Some((circuit_id, cell)))
}

/// Read one CREATED frame, returning the circuit id and raw payload.
pub async fn read_created<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<(CircuitId, Vec<u8>)> {
    let mut header = [0u8; CREATED_HEADER_SIZE];
    if !fill(reader, &mut header).await? {
        return Err(TransportError::Truncated {
            got: 0,
            want: CREATED_HEADER_SIZE,
        });
    }
    let command = Command::try_from(header[16])?;
    if command != Command::Created {
        return Err(TransportError::UnexpectedCommand {
            expected: Command::Created,
            got: command,
        });
    }
    if header[17] != PROTOCOL_VERSION {
        return Err(CellError::UnsupportedVersion(header[17]).into());
    }
    let len = usize::from(u16::from_be_bytes([header[18], header[19]]));
    if len > MAX_PAYLOAD_SIZE {
        return Err(CellError::InvalidPayloadLength(len).into());
    }
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    let mut circuit_id = [0u8; CIRCUIT_ID_SIZE];
    circuit_id.copy_from_slice(&header[..CIRCUIT_ID_SIZE]);
    Ok((circuit_id, payload))
}
