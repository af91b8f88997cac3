//! Boundary to the radio stack.
//!
//! Sending is fire-and-forget: [`MeshSender::send`] returns immediately with a
//! [`SendReceipt`] that resolves once the radio reports the outcome. Nothing
//! is retried. Receiving is a plain channel of [`MeshPacket`]s fed by
//! whichever transport is in use.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use core_framing::MeshData;
use thiserror::Error;
use tokio::sync::oneshot;

pub use core_framing::MeshPacket;

/// Failure reported for one submitted packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportSendError {
    #[error("radio rejected packet: {0}")]
    Rejected(String),

    #[error("no route to gid {0}")]
    NotConnected(u64),

    #[error("transport dropped the packet without reporting")]
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub receiver_gid: u64,
    pub data: MeshData,
    pub encrypt: bool,
}

/// Completion of one send attempt.
#[derive(Debug)]
pub struct SendReceipt {
    rx: oneshot::Receiver<Result<(), TransportSendError>>,
}

impl SendReceipt {
    /// Receipt plus the sender half a transport completes it through.
    pub fn channel() -> (oneshot::Sender<Result<(), TransportSendError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Already-completed receipt.
    pub fn ready(result: Result<(), TransportSendError>) -> Self {
        let (tx, receipt) = Self::channel();
        let _ = tx.send(result);
        receipt
    }
}

impl Future for SendReceipt {
    type Output = Result<(), TransportSendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TransportSendError::Dropped)))
    }
}

pub trait MeshSender: Send + Sync {
    fn local_gid(&self) -> u64;

    /// Submits one packet. Must not block waiting for the radio.
    fn send(&self, packet: OutboundPacket) -> SendReceipt;
}
