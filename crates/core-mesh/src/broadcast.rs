//! Raw transaction broadcast through the gateway.

use bytes::Bytes;
use core_framing::{EncodeError, Network, Payload, SegmentError, TxSegmenter, TXID_LEN};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::context::MeshContext;
use crate::transport::{SendReceipt, TransportSendError};

/// Computes the id a transaction is known by.
pub trait TxIdSource: Send + Sync {
    fn txid(&self, raw: &[u8]) -> [u8; TXID_LEN];
}

/// Double SHA-256, reversed into display order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256dTxId;

impl TxIdSource for Sha256dTxId {
    fn txid(&self, raw: &[u8]) -> [u8; TXID_LEN] {
        let mut id: [u8; TXID_LEN] = Sha256::digest(Sha256::digest(raw)).into();
        id.reverse();
        id
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("transaction hex is invalid: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Segments of one submitted transaction, still in flight.
#[derive(Debug)]
pub struct Broadcast {
    pub txid: [u8; TXID_LEN],
    receipts: Vec<(u8, SendReceipt)>,
}

impl Broadcast {
    pub fn txid_hex(&self) -> String {
        hex::encode(self.txid)
    }

    pub fn segment_count(&self) -> usize {
        self.receipts.len()
    }

    /// Waits for every segment's outcome; returns the failed ones.
    pub async fn failures(self) -> Vec<(u8, TransportSendError)> {
        let mut failed = Vec::new();
        for (index, receipt) in self.receipts {
            if let Err(e) = receipt.await {
                failed.push((index, e));
            }
        }
        failed
    }
}

impl MeshContext {
    /// Sends a hex-encoded signed transaction to the gateway, segment by segment.
    pub fn broadcast_transaction(
        &self,
        tx_hex: &str,
        network: Network,
    ) -> Result<Broadcast, BroadcastError> {
        let raw = hex::decode(tx_hex.trim())?;
        let txid = self.txid_source().txid(&raw);
        let segmenter = TxSegmenter::new(
            Bytes::from(raw),
            txid,
            network,
            self.config().tx_packet_bytes,
        )?;
        log::info!(
            "broadcasting tx {} in {} segments",
            hex::encode(txid),
            segmenter.segment_count()
        );
        let gateway = self.config().gateway_gid;
        let mut receipts = Vec::with_capacity(segmenter.len());
        for segment in segmenter {
            let index = segment.index;
            receipts.push((index, self.submit(gateway, &Payload::TxSegment(segment))?));
        }
        Ok(Broadcast { txid, receipts })
    }
}
