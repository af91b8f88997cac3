use core_cbor::CborError;
use thiserror::Error;

/// Failure to turn untrusted radio bytes into a message.
///
/// Receive loops drop the packet and keep going on either variant.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unknown envelope shape (tags {0:?})")]
    UnknownShape(Vec<u64>),
}

impl From<CborError> for DecodeError {
    fn from(e: CborError) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Cbor(#[from] CborError),
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("packet size {max} leaves no room for payload (overhead {overhead})")]
    PacketTooSmall { max: usize, overhead: usize },

    #[error("payload needs {count} segments, at most 255 fit the index field")]
    TooManySegments { count: usize },

    #[error("nothing to segment")]
    EmptyPayload,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
