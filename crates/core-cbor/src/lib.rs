//! Deterministic CBOR helpers for integer-keyed envelope maps.
//!
//! Every mesh envelope is a single top-level CBOR map whose keys are small
//! unsigned integers. Keys are kept in a `BTreeMap` so the same logical map
//! always encodes to the same bytes.

use serde::Serialize;
use serde_cbor::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// A decoded envelope body: tag number to CBOR value.
pub type TagMap = BTreeMap<u64, Value>;

#[derive(Debug, Error)]
pub enum CborError {
    #[error("cbor encode failed: {0}")]
    Encode(#[source] serde_cbor::Error),

    #[error("cbor decode failed: {0}")]
    Decode(#[source] serde_cbor::Error),

    #[error("top-level item is not a map")]
    NotAMap,

    #[error("map key is not an unsigned integer")]
    BadKey,
}

// Encode any Serialize deterministically. For maps, prefer BTreeMap to ensure key order.
// No self-describe tag: the envelope has to fit in a single radio packet.
pub fn to_det_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let mut ser = serde_cbor::ser::Serializer::new(Vec::new());
    value.serialize(&mut ser)?;
    Ok(ser.into_inner())
}

/// Encode a tag map as one definite-length CBOR map with ascending keys.
pub fn encode_tag_map(map: &TagMap) -> Result<Vec<u8>, CborError> {
    let keyed: BTreeMap<Value, Value> = map
        .iter()
        .map(|(k, v)| (Value::Integer(i128::from(*k)), v.clone()))
        .collect();
    to_det_cbor(&Value::Map(keyed)).map_err(CborError::Encode)
}

/// Decode bytes that must hold exactly one CBOR map keyed by unsigned integers.
///
/// Trailing bytes, a non-map top-level item, or a non-integer key are errors.
pub fn decode_tag_map(bytes: &[u8]) -> Result<TagMap, CborError> {
    let value: Value = serde_cbor::from_slice(bytes).map_err(CborError::Decode)?;
    let Value::Map(entries) = value else {
        return Err(CborError::NotAMap);
    };
    let mut out = TagMap::new();
    for (k, v) in entries {
        let key = match k {
            Value::Integer(i) => u64::try_from(i).map_err(|_| CborError::BadKey)?,
            _ => return Err(CborError::BadKey),
        };
        out.insert(key, v);
    }
    Ok(out)
}

/// Encoded size of a CBOR item head carrying `v` (major type bits included).
///
/// Also the length-prefix size of a byte or text string of length `v`.
pub fn head_len(v: u64) -> usize {
    match v {
        0..=23 => 1,
        24..=0xff => 2,
        0x100..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
