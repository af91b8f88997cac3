//! Wire format for proxied streams and transaction broadcasts over a
//! low-bandwidth mesh radio link.
//!
//! A radio packet holds one tagged CBOR envelope (see [`envelope`]). Payloads
//! larger than one packet are cut by a segmenter and joined again by a
//! reassembler on the far side.

pub mod envelope;
mod error;
mod message;
mod reassembly;
mod segment;
mod stream_id;

pub use envelope::{tags, Envelope};
pub use error::{DecodeError, EncodeError, SegmentError};
pub use message::{
    gid_from_phone_number, is_global_phone_number, Destination, MeshData, MeshPacket, Message,
    Network, Payload, SmsBody, SmsMessage, StreamChunk, TextMessage, TxOpen, TxSegment,
    GATEWAY_GID, SHORT_TXID_LEN, TXID_LEN,
};
pub use reassembly::{Reassembled, Reassembler, TxReassembled, TxReassembler};
pub use segment::{
    StreamSegmenter, TxSegmenter, MAX_SEGMENTS, STREAM_PACKET_BYTES, TX_PACKET_BYTES,
};
pub use stream_id::StreamId;
