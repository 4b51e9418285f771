//! Whole-object serialization.
//!
//! Named objects are stored as an envelope around a postcard payload:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Magic (4B): "KSOB"                        │
//! │ Type name length (2B, LE)                 │
//! │ Type name (UTF-8)                         │
//! │ Payload (postcard)                        │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The type name lets `load_object` report a `TypeMismatch` instead of
//! decoding garbage: postcard is not self-describing. The format is only
//! meant to be read back by this crate.

use crate::error::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;

/// Magic bytes for object envelopes.
pub const OBJECT_MAGIC: [u8; 4] = *b"KSOB";

const HEADER_LEN: usize = OBJECT_MAGIC.len() + 2;

/// Encode `value` with its type tag.
pub fn encode_object<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let tag = type_name::<T>().as_bytes();
    let tag_len = u16::try_from(tag.len())
        .map_err(|_| StorageError::Serialization(format!("type name too long: {}", tag.len())))?;

    let payload = postcard::to_allocvec(value)?;
    let mut out = Vec::with_capacity(HEADER_LEN + tag.len() + payload.len());
    out.extend_from_slice(&OBJECT_MAGIC);
    out.extend_from_slice(&tag_len.to_le_bytes());
    out.extend_from_slice(tag);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode an envelope produced by [`encode_object`] as `T`.
pub fn decode_object<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (stored, payload) = split_envelope(bytes)?;
    let expected = type_name::<T>();
    if stored != expected {
        return Err(StorageError::type_mismatch(expected, stored));
    }
    postcard::from_bytes(payload).map_err(|e| {
        StorageError::Deserialization(format!("payload for {expected} is corrupt: {e}"))
    })
}

/// Type name recorded in an envelope.
pub fn stored_type_name(bytes: &[u8]) -> Result<&str> {
    split_envelope(bytes).map(|(name, _)| name)
}

fn split_envelope(bytes: &[u8]) -> Result<(&str, &[u8])> {
    if bytes.len() < HEADER_LEN || bytes[..4] != OBJECT_MAGIC {
        return Err(StorageError::Deserialization(
            "invalid object envelope: bad magic".to_string(),
        ));
    }
    let tag_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    let rest = &bytes[HEADER_LEN..];
    if rest.len() < tag_len {
        return Err(StorageError::Deserialization(
            "invalid object envelope: truncated type name".to_string(),
        ));
    }
    let (tag, payload) = rest.split_at(tag_len);
    let name = std::str::from_utf8(tag).map_err(|e| {
        StorageError::Deserialization(format!("invalid object envelope: type name: {e}"))
    })?;
    Ok((name, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Coefficients {
        intercept: f64,
        weights: HashMap<String, f64>,
    }

    #[test]
    fn struct_roundtrip() {
        let mut weights = HashMap::new();
        weights.insert("x1".to_string(), 0.25);
        weights.insert("x2".to_string(), -1.5);
        let value = Coefficients {
            intercept: 3.0,
            weights,
        };

        let bytes = encode_object(&value).unwrap();
        assert_eq!(&bytes[..4], b"KSOB");
        let back: Coefficients = decode_object(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn wrong_type_is_a_mismatch() {
        let bytes = encode_object(&42u64).unwrap();
        let err = decode_object::<String>(&bytes).unwrap_err();
        match err {
            StorageError::TypeMismatch { expected, found } => {
                assert!(expected.contains("String"));
                assert_eq!(found, "u64");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn stored_type_name_reads_header() {
        let bytes = encode_object(&vec![1u32, 2, 3]).unwrap();
        assert!(stored_type_name(&bytes).unwrap().contains("Vec<u32>"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_object::<u64>(b"nope"),
            Err(StorageError::Deserialization(_))
        ));

        let mut bytes = encode_object(&7u32).unwrap();
        bytes[4] = 0xFF; // claim a type name longer than the buffer
        assert!(matches!(
            decode_object::<u32>(&bytes),
            Err(StorageError::Deserialization(_))
        ));
    }

    #[test]
    fn truncated_payload_is_corrupt_not_mismatch() {
        let value = Coefficients {
            intercept: 1.0,
            weights: HashMap::from([("a".to_string(), 2.0)]),
        };
        let bytes = encode_object(&value).unwrap();
        let cut = &bytes[..bytes.len() - 4];
        assert!(matches!(
            decode_object::<Coefficients>(cut),
            Err(StorageError::Deserialization(_))
        ));
    }
}
