//! Canonical DAG-CBOR encoding.
//!
//! Values are first lowered into a [`ciborium::Value`] so map keys can be put into canonical
//! order (shorter encoded keys first, then bytewise) before writing. Links serialize as CBOR
//! tag 42, see [`Link`](crate::Link).
//!
//! Serde enums must be externally tagged. Internally tagged, untagged and flattened
//! representations buffer their content and lose the link tag.

use std::cmp::Ordering;

use ciborium::Value;
use serde::{de::DeserializeOwned, Serialize};

/// Errors from the DAG-CBOR codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Encodes `value` as canonical DAG-CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let value = Value::serialized(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    let value = canonicalize(value)?;
    let mut out = Vec::new();
    ciborium::into_writer(&value, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes DAG-CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

fn canonicalize(value: Value) -> Result<Value, CodecError> {
    Ok(match value {
        Value::Map(entries) => {
            let mut keyed = entries
                .into_iter()
                .map(|(k, v)| {
                    let k = canonicalize(k)?;
                    let mut key_bytes = Vec::new();
                    ciborium::into_writer(&k, &mut key_bytes)
                        .map_err(|e| CodecError::Encode(e.to_string()))?;
                    Ok((key_bytes, k, canonicalize(v)?))
                })
                .collect::<Result<Vec<_>, CodecError>>()?;
            keyed.sort_by(|(a, _, _), (b, _, _)| key_order(a, b));
            Value::Map(keyed.into_iter().map(|(_, k, v)| (k, v)).collect())
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(canonicalize)
                .collect::<Result<_, _>>()?,
        ),
        Value::Tag(tag, inner) => Value::Tag(tag, Box::new(canonicalize(*inner)?)),
        other => other,
    })
}

fn key_order(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
