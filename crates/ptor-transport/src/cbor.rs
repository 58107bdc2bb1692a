//! CBOR serialization helpers for payload records.
//!
//! This module wraps [`ciborium`]. Every record carried inside a cell is
//! CBOR-encoded before any onion sealing is applied.

use serde::{de::DeserializeOwned, Serialize};

use crate::TransportError;

/// Serialize a value to CBOR bytes, naming the type in any error.
pub fn to_vec_named<T: Serialize>(value: &T, type_name: &str) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| {
        TransportError::Serialization(format!("CBOR serialization of {type_name} failed: {e}"))
    })?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes, naming the type in any error.
pub fn from_slice_named<T: DeserializeOwned>(
    data: &[u8],
    type_name: &str,
) -> Result<T, TransportError> {
    ciborium::from_reader(data).map_err(|e| {
        TransportError::Deserialization(format!("CBOR deserialization of {type_name} failed: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::End;

    #[test]
    fn test_roundtrip_named() {
        let end = End { stream_id: 7 };
        let bytes = to_vec_named(&end, "End").expect("serialize");
        let restored: End = from_slice_named(&bytes, "End").expect("deserialize");
        assert_eq!(restored, end);
    }

    #[test]
    fn test_invalid_data_names_type() {
        let result: Result<End, _> = from_slice_named(&[0xFF, 0xFF, 0xFF], "End");
        let err = result.expect_err("must fail");
        assert!(err.to_string().contains("End"));
    }

    #[test]
    fn test_cbor_is_compact() {
        let end = End { stream_id: 1 };
        let cbor = to_vec_named(&end, "End").expect("serialize");
        let json = serde_json::to_vec(&end).expect("serialize json");
        assert!(cbor.len() <= json.len());
    }
}
