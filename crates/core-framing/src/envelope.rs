//! Tagged binary envelope: one radio packet's worth of CBOR map.

use core_cbor::{decode_tag_map, encode_tag_map, TagMap};
use serde_cbor::Value;

use crate::error::{DecodeError, EncodeError};

/// Fixed tag numbers shared with the gateway firmware.
pub mod tags {
    pub const BYTE_STRING: u64 = 24;
    pub const PHONE_NUMBER: u64 = 25;
    pub const MESSAGE_TEXT: u64 = 26;
    pub const NETWORK: u64 = 27;
    pub const SEGMENT_INDEX: u64 = 28;
    pub const SEGMENT_COUNT: u64 = 29;
    pub const SHORT_TXID: u64 = 30;
    pub const TXID: u64 = 31;
    pub const HOST: u64 = 32;
    pub const PORT: u64 = 33;
    pub const STREAM_ID: u64 = 34;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    fields: TagMap,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(mut self, tag: u64, bytes: &[u8]) -> Self {
        self.fields.insert(tag, Value::Bytes(bytes.to_vec()));
        self
    }

    pub fn with_text(mut self, tag: u64, text: &str) -> Self {
        self.fields.insert(tag, Value::Text(text.to_string()));
        self
    }

    pub fn with_uint(mut self, tag: u64, v: u64) -> Self {
        self.fields.insert(tag, Value::Integer(i128::from(v)));
        self
    }

    pub fn has(&self, tag: u64) -> bool {
        self.fields.contains_key(&tag)
    }

    /// Tags present, ascending.
    pub fn tags(&self) -> Vec<u64> {
        self.fields.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Byte string under `tag`, `None` when absent, `Malformed` on any other type.
    pub fn bytes(&self, tag: u64) -> Result<Option<&[u8]>, DecodeError> {
        match self.fields.get(&tag) {
            None => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b.as_slice())),
            Some(other) => Err(type_mismatch(tag, "byte string", other)),
        }
    }

    pub fn text(&self, tag: u64) -> Result<Option<&str>, DecodeError> {
        match self.fields.get(&tag) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(type_mismatch(tag, "text", other)),
        }
    }

    pub fn uint(&self, tag: u64) -> Result<Option<u64>, DecodeError> {
        match self.fields.get(&tag) {
            None => Ok(None),
            Some(Value::Integer(i)) => u64::try_from(*i)
                .map(Some)
                .map_err(|_| DecodeError::Malformed(format!("tag {tag}: negative integer"))),
            Some(other) => Err(type_mismatch(tag, "unsigned integer", other)),
        }
    }

    /// Raw value, for tags that accept more than one wire type.
    pub fn value(&self, tag: u64) -> Option<&Value> {
        self.fields.get(&tag)
    }

    pub fn require_bytes(&self, tag: u64) -> Result<&[u8], DecodeError> {
        self.bytes(tag)?.ok_or_else(|| missing(tag))
    }

    pub fn require_text(&self, tag: u64) -> Result<&str, DecodeError> {
        self.text(tag)?.ok_or_else(|| missing(tag))
    }

    pub fn require_uint(&self, tag: u64) -> Result<u64, DecodeError> {
        self.uint(tag)?.ok_or_else(|| missing(tag))
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(encode_tag_map(&self.fields)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            fields: decode_tag_map(bytes)?,
        })
    }
}

fn missing(tag: u64) -> DecodeError {
    DecodeError::Malformed(format!("tag {tag}: missing"))
}

fn type_mismatch(tag: u64, want: &str, got: &Value) -> DecodeError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Integer(_) => "integer",
        Value::Float(_) => "float",
        Value::Bytes(_) => "byte string",
        Value::Text(_) => "text",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Tag(..) => "tagged item",
        _ => "other",
    };
    DecodeError::Malformed(format!("tag {tag}: expected {want}, got {got}"))
}
