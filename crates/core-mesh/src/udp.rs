//! Datagram transport towards a radio bridge process.
//!
//! Each datagram carries one mesh packet:
//!
//! ```text
//! [sender gid u64][receiver gid u64][sent at, ms since epoch u64][kind u8][encrypt u8][payload]
//! ```
//!
//! `kind` is 0 for a binary envelope and 1 for UTF-8 text. The bridge on the
//! other side owns the radio and applies `encrypt`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use core_framing::MeshData;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::transport::{MeshPacket, MeshSender, OutboundPacket, SendReceipt, TransportSendError};

const HEADER_LEN: usize = 8 + 8 + 8 + 1 + 1;
const KIND_BINARY: u8 = 0;
const KIND_TEXT: u8 = 1;
const MTU: usize = 2048;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

type Completion = oneshot::Sender<Result<(), TransportSendError>>;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("datagram shorter than header ({0} bytes)")]
    Truncated(usize),

    #[error("unknown payload kind {0}")]
    UnknownKind(u8),

    #[error("text payload is not UTF-8")]
    BadText,
}

pub fn encode_frame(packet: &MeshPacket, encrypt: bool) -> Bytes {
    let (kind, payload): (u8, &[u8]) = match &packet.data {
        MeshData::Binary(b) => (KIND_BINARY, &b[..]),
        MeshData::Text(t) => (KIND_TEXT, t.as_bytes()),
    };
    let sent_ms = packet
        .sent_at
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u64(packet.sender_gid);
    out.put_u64(packet.receiver_gid);
    out.put_u64(sent_ms);
    out.put_u8(kind);
    out.put_u8(u8::from(encrypt));
    out.put_slice(payload);
    out.freeze()
}

pub fn decode_frame(mut frame: &[u8]) -> Result<MeshPacket, FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    let sender_gid = frame.get_u64();
    let receiver_gid = frame.get_u64();
    let sent_at = UNIX_EPOCH + Duration::from_millis(frame.get_u64());
    let kind = frame.get_u8();
    let _encrypt = frame.get_u8();
    let data = match kind {
        KIND_BINARY => MeshData::Binary(Bytes::copy_from_slice(frame)),
        KIND_TEXT => MeshData::Text(
            std::str::from_utf8(frame)
                .map_err(|_| FrameError::BadText)?
                .to_string(),
        ),
        other => return Err(FrameError::UnknownKind(other)),
    };
    Ok(MeshPacket {
        sender_gid,
        receiver_gid,
        sent_at,
        data,
    })
}

/// Sends every packet to one bridge address and reads whatever it forwards back.
///
/// Datagrams leave in the order `send` was called: a single writer task
/// drains the outbound queue.
#[derive(Clone)]
pub struct UdpMesh {
    gid: u64,
    socket: Arc<UdpSocket>,
    outbound: mpsc::UnboundedSender<(Bytes, Completion)>,
}

impl UdpMesh {
    pub async fn bind(
        gid: u64,
        bind_addr: SocketAddr,
        forward_addr: SocketAddr,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<MeshPacket>)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        log::info!("udp mesh bound to <{}>, forwarding to <{}>", socket.local_addr()?, forward_addr);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(receive_loop(socket.clone(), gid, tx));
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(send_loop(socket.clone(), forward_addr, queue));
        Ok((
            Self {
                gid,
                socket,
                outbound,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, gid: u64, tx: mpsc::UnboundedSender<MeshPacket>) {
    let mut buf = vec![0u8; MTU];
    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = tx.closed() => break,
        };
        match received {
            Ok((n, from)) => match decode_frame(&buf[..n]) {
                Ok(packet) if packet.receiver_gid == gid => {
                    log::trace!("udp mesh: rx << {} bytes from gid {}", n, packet.sender_gid);
                    if tx.send(packet).is_err() {
                        break;
                    }
                }
                Ok(packet) => {
                    log::debug!("udp mesh: ignoring packet for gid {}", packet.receiver_gid);
                }
                Err(e) => log::warn!("udp mesh: bad datagram from {}: {}", from, e),
            },
            // ICMP errors (e.g. ConnectionReset) surface here and do not end the link
            Err(e) => {
                log::warn!("udp mesh: receive error {}", e);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
    log::info!("udp mesh: receive loop closed");
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    to: SocketAddr,
    mut queue: mpsc::UnboundedReceiver<(Bytes, Completion)>,
) {
    while let Some((frame, done)) = queue.recv().await {
        let result = match socket.send_to(&frame, to).await {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => Err(TransportSendError::Rejected(format!(
                "short datagram write {n}/{}",
                frame.len()
            ))),
            Err(e) => Err(TransportSendError::Rejected(e.to_string())),
        };
        if let Err(e) = &result {
            log::warn!("udp mesh: send to {} failed: {}", to, e);
        }
        let _ = done.send(result);
    }
    log::debug!("udp mesh: send loop closed");
}

impl MeshSender for UdpMesh {
    fn local_gid(&self) -> u64 {
        self.gid
    }

    fn send(&self, packet: OutboundPacket) -> SendReceipt {
        let frame = encode_frame(
            &MeshPacket {
                sender_gid: self.gid,
                receiver_gid: packet.receiver_gid,
                sent_at: SystemTime::now(),
                data: packet.data,
            },
            packet.encrypt,
        );
        let (done, receipt) = SendReceipt::channel();
        // a closed queue drops `done`, which the receipt reports as Dropped
        let _ = self.outbound.send((frame, done));
        receipt
    }
}
