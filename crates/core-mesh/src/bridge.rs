//! Per-connection adapter between a loopback TCP socket and the mesh.
//!
//! The proxy relay connects to the bridge's loopback port instead of the real
//! destination. Every read from that socket becomes one logical message,
//! segmented and sent to the gateway; every complete message coming back for
//! the bridge's stream id is written to the socket.
//!
//! ```text
//!  Idle --open--> Streaming --local EOF / remote close / error--> Closing --> Closed
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use core_framing::{Destination, Payload, SegmentError, StreamChunk, StreamId, StreamSegmenter};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::context::MeshContext;
use crate::registry::{Registration, RegistryError, StreamEvent};
use crate::transport::SendReceipt;

/// Largest local read turned into one message.
pub const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge was already opened")]
    AlreadyOpen,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("destination does not fit a stream packet: {0}")]
    Segment(#[from] SegmentError),

    #[error("loopback socket: {0}")]
    Socket(#[from] io::Error),
}

pub struct MeshTunnelBridge {
    ctx: MeshContext,
    state: Arc<watch::Sender<BridgeState>>,
    stream_id: Option<StreamId>,
}

impl MeshTunnelBridge {
    pub fn new(ctx: MeshContext) -> Self {
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            ctx,
            state: Arc::new(state),
            stream_id: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    /// Binds the loopback listener for a connection to `host:port` and starts
    /// the streaming task. Returns the address the relay should connect to.
    pub async fn open(&mut self, host: &str, port: u16) -> Result<SocketAddr, BridgeError> {
        if self.state() != BridgeState::Idle {
            return Err(BridgeError::AlreadyOpen);
        }
        let id = StreamId::derive(self.ctx.local_gid(), host, port);
        let destination = Destination::new(host, port);
        // the open shape must leave room for payload at this packet size
        StreamSegmenter::new(
            id,
            Some(destination.clone()),
            Bytes::new(),
            self.ctx.config().stream_packet_bytes,
        )?;
        let registration = self.ctx.registry().register(id)?;
        let listener = self.ctx.ports().bind_loopback().await?;
        let addr = listener.local_addr()?;

        self.stream_id = Some(id);
        self.state.send_replace(BridgeState::Streaming);
        log::info!("stream {} for {}:{} on loopback {}", id, host, port, addr);

        let task = StreamTask {
            ctx: self.ctx.clone(),
            id,
            destination: Some(destination),
            state: self.state.clone(),
        };
        tokio::spawn(task.run(listener, registration));
        Ok(addr)
    }
}

struct StreamTask {
    ctx: MeshContext,
    id: StreamId,
    destination: Option<Destination>,
    state: Arc<watch::Sender<BridgeState>>,
}

impl StreamTask {
    async fn run(mut self, listener: TcpListener, mut registration: Registration) {
        let accepted = timeout(self.ctx.config().accept_timeout(), listener.accept()).await;
        drop(listener);
        let socket = match accepted {
            Ok(Ok((socket, _peer))) => socket,
            Ok(Err(e)) => {
                log::warn!("stream {}: loopback accept failed: {}", self.id, e);
                self.finish();
                return;
            }
            Err(_) => {
                log::warn!("stream {}: nobody connected to loopback listener", self.id);
                self.finish();
                return;
            }
        };

        let (mut rd, mut wr) = socket.into_split();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                read = rd.read(&mut buf) => match read {
                    Ok(0) => {
                        log::debug!("stream {}: local end closed", self.id);
                        self.state.send_replace(BridgeState::Closing);
                        self.send_close();
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = self.send_message(Bytes::copy_from_slice(&buf[..n])) {
                            log::warn!("stream {}: cannot segment {} bytes: {}", self.id, n, e);
                            self.state.send_replace(BridgeState::Closing);
                            self.send_close();
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("stream {}: local read failed: {}", self.id, e);
                        self.state.send_replace(BridgeState::Closing);
                        self.send_close();
                        break;
                    }
                },
                event = registration.recv() => match event {
                    Some(StreamEvent::Data(data)) => {
                        if let Err(e) = write_local(&mut wr, &data).await {
                            log::warn!("stream {}: local write failed: {}", self.id, e);
                            self.state.send_replace(BridgeState::Closing);
                            self.send_close();
                            break;
                        }
                    }
                    Some(StreamEvent::Closed) | None => {
                        log::debug!("stream {}: closed by remote", self.id);
                        self.state.send_replace(BridgeState::Closing);
                        break;
                    }
                },
            }
        }

        // remote-close must not be answered with another close
        drop(registration);
        let _ = wr.shutdown().await;
        self.finish();
    }

    fn finish(&self) {
        self.state.send_replace(BridgeState::Closed);
        log::debug!("stream {}: closed", self.id);
    }

    /// Segments one local read and submits every segment without waiting.
    fn send_message(&mut self, payload: Bytes) -> Result<(), SegmentError> {
        let segmenter = StreamSegmenter::new(
            self.id,
            self.destination.take(),
            payload,
            self.ctx.config().stream_packet_bytes,
        )?;
        let count = segmenter.segment_count();
        let gateway = self.ctx.config().gateway_gid;
        let mut receipts = Vec::with_capacity(usize::from(count));
        for chunk in segmenter {
            let index = chunk.index;
            receipts.push((index, self.ctx.submit(gateway, &Payload::StreamChunk(chunk))?));
        }
        log::trace!("stream {}: submitted {} segments", self.id, count);
        tokio::spawn(report_sends(self.id, count, receipts));
        Ok(())
    }

    fn send_close(&self) {
        match self
            .ctx
            .submit(self.ctx.config().gateway_gid, &Payload::StreamChunk(StreamChunk::close(self.id)))
        {
            Ok(receipt) => {
                tokio::spawn(report_sends(self.id, 1, vec![(0, receipt)]));
            }
            Err(e) => log::warn!("stream {}: cannot encode close signal: {}", self.id, e),
        }
    }
}

async fn write_local(wr: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
    wr.write_all(data).await?;
    wr.flush().await
}

async fn report_sends(id: StreamId, count: u8, receipts: Vec<(u8, SendReceipt)>) {
    for (index, receipt) in receipts {
        if let Err(e) = receipt.await {
            log::warn!("stream {}: segment {}/{} not sent: {}", id, index, count, e);
        }
    }
}
