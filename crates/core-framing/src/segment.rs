//! Splitting a byte buffer into envelopes that each fit one radio packet.
//!
//! Capacity per segment is `max_packet_bytes - overhead(shape)`. The overhead
//! is measured by encoding the shape with an empty payload and worst-case
//! index/count, plus the largest byte-string header `max_packet_bytes` can
//! need, so every produced envelope encodes to at most `max_packet_bytes`.
//!
//! Segmenters are iterators: a caller can transmit segment 0 before the
//! remaining slices are cut.

use bytes::Bytes;
use core_cbor::head_len;

use crate::error::SegmentError;
use crate::message::{
    Destination, Network, StreamChunk, TxOpen, TxSegment, SHORT_TXID_LEN, TXID_LEN,
};
use crate::stream_id::StreamId;

pub const MAX_SEGMENTS: usize = u8::MAX as usize;

/// Default packet budget for stream chunks.
pub const STREAM_PACKET_BYTES: usize = 150;
/// Default packet budget for transaction broadcasts.
pub const TX_PACKET_BYTES: usize = 200;

fn overhead(template_len: usize, max_packet_bytes: usize) -> usize {
    // template carries an empty byte string (1-byte head)
    template_len - head_len(0) + head_len(max_packet_bytes as u64)
}

fn capacity(max_packet_bytes: usize, overhead: usize) -> Result<usize, SegmentError> {
    if max_packet_bytes <= overhead {
        return Err(SegmentError::PacketTooSmall {
            max: max_packet_bytes,
            overhead,
        });
    }
    Ok(max_packet_bytes - overhead)
}

fn segment_count(len: usize, first_capacity: usize, capacity: usize) -> Result<u8, SegmentError> {
    let count = if len <= first_capacity {
        1
    } else {
        1 + (len - first_capacity + capacity - 1) / capacity
    };
    u8::try_from(count).map_err(|_| SegmentError::TooManySegments { count })
}

/// Segments one logical message of a proxied stream.
///
/// With a destination the first segment uses the open shape (host, port,
/// count); all others use the continuation shape. An empty payload yields a
/// single zero-length chunk, which receivers treat as end of stream.
#[derive(Debug, Clone)]
pub struct StreamSegmenter {
    stream_id: StreamId,
    destination: Option<Destination>,
    payload: Bytes,
    first_capacity: usize,
    capacity: usize,
    count: u8,
    next: u8,
    offset: usize,
}

impl StreamSegmenter {
    pub fn new(
        stream_id: StreamId,
        destination: Option<Destination>,
        payload: Bytes,
        max_packet_bytes: usize,
    ) -> Result<Self, SegmentError> {
        let worst = |destination: Option<Destination>| StreamChunk {
            stream_id,
            destination,
            index: u8::MAX,
            count: u8::MAX,
            payload: Bytes::new(),
        };
        let cont_len = worst(None).encode()?.len();
        let capacity = capacity(max_packet_bytes, overhead(cont_len, max_packet_bytes))?;
        let first_capacity = match &destination {
            Some(dest) => {
                let open_len = worst(Some(dest.clone())).encode()?.len();
                self::capacity(max_packet_bytes, overhead(open_len, max_packet_bytes))?
            }
            None => capacity,
        };
        let count = segment_count(payload.len(), first_capacity, capacity)?;
        Ok(Self {
            stream_id,
            destination,
            payload,
            first_capacity,
            capacity,
            count,
            next: 0,
            offset: 0,
        })
    }

    pub fn segment_count(&self) -> u8 {
        self.count
    }

    pub fn first_capacity(&self) -> usize {
        self.first_capacity
    }

    pub fn continuation_capacity(&self) -> usize {
        self.capacity
    }
}

impl Iterator for StreamSegmenter {
    type Item = StreamChunk;

    fn next(&mut self) -> Option<StreamChunk> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        let cap = if index == 0 {
            self.first_capacity
        } else {
            self.capacity
        };
        let end = (self.offset + cap).min(self.payload.len());
        let payload = self.payload.slice(self.offset..end);
        self.offset = end;
        self.next += 1;
        let destination = if index == 0 {
            self.destination.take()
        } else {
            None
        };
        Some(StreamChunk {
            stream_id: self.stream_id,
            destination,
            index,
            count: self.count,
            payload,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = usize::from(self.count - self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for StreamSegmenter {}

/// Segments a raw signed transaction for broadcast through the gateway.
#[derive(Debug, Clone)]
pub struct TxSegmenter {
    short_id: [u8; SHORT_TXID_LEN],
    txid: [u8; TXID_LEN],
    network: Network,
    raw: Bytes,
    first_capacity: usize,
    capacity: usize,
    count: u8,
    next: u8,
    offset: usize,
}

impl TxSegmenter {
    pub fn new(
        raw: Bytes,
        txid: [u8; TXID_LEN],
        network: Network,
        max_packet_bytes: usize,
    ) -> Result<Self, SegmentError> {
        if raw.is_empty() {
            return Err(SegmentError::EmptyPayload);
        }
        let mut short_id = [0u8; SHORT_TXID_LEN];
        short_id.copy_from_slice(&txid[..SHORT_TXID_LEN]);

        let first = TxSegment {
            short_id,
            index: 0,
            open: Some(TxOpen {
                txid,
                count: u8::MAX,
                network,
            }),
            payload: Bytes::new(),
        };
        let cont = TxSegment {
            short_id,
            index: u8::MAX,
            open: None,
            payload: Bytes::new(),
        };
        let first_capacity = capacity(
            max_packet_bytes,
            overhead(first.encode()?.len(), max_packet_bytes),
        )?;
        let capacity = capacity(
            max_packet_bytes,
            overhead(cont.encode()?.len(), max_packet_bytes),
        )?;
        let count = segment_count(raw.len(), first_capacity, capacity)?;
        Ok(Self {
            short_id,
            txid,
            network,
            raw,
            first_capacity,
            capacity,
            count,
            next: 0,
            offset: 0,
        })
    }

    pub fn short_id(&self) -> [u8; SHORT_TXID_LEN] {
        self.short_id
    }

    pub fn segment_count(&self) -> u8 {
        self.count
    }

    pub fn first_capacity(&self) -> usize {
        self.first_capacity
    }

    pub fn continuation_capacity(&self) -> usize {
        self.capacity
    }
}

impl Iterator for TxSegmenter {
    type Item = TxSegment;

    fn next(&mut self) -> Option<TxSegment> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        let (cap, open) = if index == 0 {
            let open = TxOpen {
                txid: self.txid,
                count: self.count,
                network: self.network,
            };
            (self.first_capacity, Some(open))
        } else {
            (self.capacity, None)
        };
        let end = (self.offset + cap).min(self.raw.len());
        let payload = self.raw.slice(self.offset..end);
        self.offset = end;
        self.next += 1;
        Some(TxSegment {
            short_id: self.short_id,
            index,
            open,
            payload,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = usize::from(self.count - self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for TxSegmenter {}
