//! Receiver-side joining of segments back into logical messages.
//!
//! Segments are assumed to arrive in order; there is no sequencing or
//! retransmission on the radio link, so a lost segment shows up as a
//! message that never completes (or is cut short by the next index 0).

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

use crate::message::{Network, StreamChunk, TxSegment, SHORT_TXID_LEN, TXID_LEN};
use crate::stream_id::StreamId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembled {
    /// More segments are expected.
    Pending,
    /// The final segment arrived; the whole message.
    Complete(Bytes),
    /// The peer closed the stream.
    Closed,
}

/// Per-stream accumulation buffers.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<StreamId, BytesMut>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_chunk(&mut self, chunk: &StreamChunk) -> Reassembled {
        if chunk.is_close() {
            self.partial.remove(&chunk.stream_id);
            return Reassembled::Closed;
        }
        if chunk.index == 0 && chunk.is_last() {
            // single-segment fast path
            self.partial.remove(&chunk.stream_id);
            return Reassembled::Complete(chunk.payload.clone());
        }
        let buf = self.partial.entry(chunk.stream_id).or_default();
        if chunk.index == 0 {
            buf.clear();
        }
        buf.extend_from_slice(&chunk.payload);
        if chunk.is_last() {
            let done = self
                .partial
                .remove(&chunk.stream_id)
                .unwrap_or_default()
                .freeze();
            Reassembled::Complete(done)
        } else {
            Reassembled::Pending
        }
    }

    /// Drops any partial message for `id`.
    pub fn forget(&mut self, id: &StreamId) {
        self.partial.remove(id);
    }

    /// Bytes held for a message still being received.
    pub fn buffered(&self, id: &StreamId) -> usize {
        self.partial.get(id).map_or(0, BytesMut::len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxReassembled {
    Pending,
    Complete {
        txid: [u8; TXID_LEN],
        network: Network,
        raw: Bytes,
    },
    /// A continuation for a transaction whose first segment was never seen.
    Orphan,
}

#[derive(Debug)]
struct PendingTx {
    txid: [u8; TXID_LEN],
    network: Network,
    count: u8,
    buf: BytesMut,
}

/// Joins transaction segments keyed by short txid.
///
/// Continuations carry no count, so it is taken from the first segment.
#[derive(Debug, Default)]
pub struct TxReassembler {
    pending: HashMap<[u8; SHORT_TXID_LEN], PendingTx>,
}

impl TxReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_segment(&mut self, seg: &TxSegment) -> TxReassembled {
        if let Some(open) = &seg.open {
            let mut buf = BytesMut::with_capacity(seg.payload.len() * usize::from(open.count));
            buf.extend_from_slice(&seg.payload);
            if open.count <= 1 {
                self.pending.remove(&seg.short_id);
                return TxReassembled::Complete {
                    txid: open.txid,
                    network: open.network,
                    raw: buf.freeze(),
                };
            }
            self.pending.insert(
                seg.short_id,
                PendingTx {
                    txid: open.txid,
                    network: open.network,
                    count: open.count,
                    buf,
                },
            );
            return TxReassembled::Pending;
        }

        let Some(p) = self.pending.get_mut(&seg.short_id) else {
            return TxReassembled::Orphan;
        };
        p.buf.extend_from_slice(&seg.payload);
        if u16::from(seg.index) + 1 < u16::from(p.count) {
            return TxReassembled::Pending;
        }
        match self.pending.remove(&seg.short_id) {
            Some(p) => TxReassembled::Complete {
                txid: p.txid,
                network: p.network,
                raw: p.buf.freeze(),
            },
            None => TxReassembled::Orphan,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
