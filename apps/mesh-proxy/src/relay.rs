//! Per-client proxy relay: SOCKS negotiation, upstream connect, byte pump.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use core_mesh::{BridgeError, MeshContext, MeshTunnelBridge};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::socks::{self, HandshakeError, Reply, SocksCommand, SocksRequest};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("SOCKS handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("SOCKS handshake timed out after {timeout_secs}s")]
    HandshakeTimeout { timeout_secs: u64 },

    #[error("SOCKS command {0:?} is not supported")]
    UnsupportedCommand(SocksCommand),

    #[error("mesh tunnel: {0}")]
    Bridge(#[from] BridgeError),

    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no traffic for {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    fn reply(&self) -> Reply {
        match self {
            RelayError::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused => {
                Reply::ConnectionRefused
            }
            RelayError::Connect { .. } => Reply::HostUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Where the relay sends a negotiated connection.
#[async_trait]
pub trait Upstream: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect_to_server(&mut self, host: &str, port: u16) -> Result<Self::Stream, RelayError>;
}

/// Plain TCP to the requested destination.
#[derive(Debug, Default)]
pub struct DirectUpstream;

#[async_trait]
impl Upstream for DirectUpstream {
    type Stream = TcpStream;

    async fn connect_to_server(&mut self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
        TcpStream::connect((host, port))
            .await
            .map_err(|source| RelayError::Connect {
                host: host.to_string(),
                port,
                source,
            })
    }
}

/// Ignores the real destination and talks to a fresh mesh tunnel bridge on loopback.
pub struct MeshUpstream {
    bridge: MeshTunnelBridge,
}

impl MeshUpstream {
    pub fn new(ctx: &MeshContext) -> Self {
        Self {
            bridge: ctx.new_bridge(),
        }
    }
}

#[async_trait]
impl Upstream for MeshUpstream {
    type Stream = TcpStream;

    async fn connect_to_server(&mut self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
        let loopback = self.bridge.open(host, port).await?;
        let stream = TcpStream::connect(loopback)
            .await
            .map_err(|source| RelayError::Connect {
                host: loopback.ip().to_string(),
                port: loopback.port(),
                source,
            })?;
        debug!(%host, port, %loopback, "connected to mesh bridge");
        Ok(stream)
    }
}

const PUMP_BUF: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub handshake_timeout_secs: u64,
    /// Closes a connection after this long without data in either direction; 0 disables.
    pub idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

pub struct ProxyRelay<U> {
    upstream: U,
    config: RelayConfig,
}

impl<U: Upstream> ProxyRelay<U> {
    pub fn new(upstream: U, config: RelayConfig) -> Self {
        Self { upstream, config }
    }

    /// Serves one client to completion. Returns (bytes to server, bytes to client).
    pub async fn run<C>(mut self, mut client: C) -> Result<(u64, u64), RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let secs = self.config.handshake_timeout_secs;
        let request = timeout(Duration::from_secs(secs), socks::negotiate(&mut client))
            .await
            .map_err(|_| RelayError::HandshakeTimeout { timeout_secs: secs })??;
        let SocksRequest {
            version,
            command,
            host,
            port,
        } = request;
        info!(%host, port, ?command, ?version, "SOCKS request");

        if command == SocksCommand::UdpAssociate {
            socks::send_reply(&mut client, version, Reply::CommandNotSupported, None).await?;
            return Err(RelayError::UnsupportedCommand(command));
        }

        let mut server = match self.upstream.connect_to_server(&host, port).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%host, port, error = %e, "upstream connect failed");
                socks::send_reply(&mut client, version, e.reply(), None).await?;
                return Err(e);
            }
        };
        socks::send_reply(&mut client, version, Reply::Succeeded, None).await?;
        if command == SocksCommand::Bind {
            // second reply: the "incoming" connection is already there
            socks::send_reply(&mut client, version, Reply::Succeeded, None).await?;
        }

        forward_bidirectional(&mut client, &mut server, self.config.idle_timeout_secs).await
    }
}

/// Pumps bytes both ways until both sides have closed. EOF on one side is
/// passed on as a write shutdown to the other. The idle deadline restarts on
/// every transfer.
pub async fn forward_bidirectional<A, B>(
    a: &mut A,
    b: &mut B,
    idle_timeout_secs: u64,
) -> Result<(u64, u64), RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let idle = Duration::from_secs(idle_timeout_secs);
    let deadline = sleep(idle);
    tokio::pin!(deadline);

    let mut a_buf = vec![0u8; PUMP_BUF];
    let mut b_buf = vec![0u8; PUMP_BUF];
    let (mut a_open, mut b_open) = (true, true);
    let (mut to_b, mut to_a) = (0u64, 0u64);

    while a_open || b_open {
        tokio::select! {
            read = a.read(&mut a_buf), if a_open => {
                let n = read?;
                if n == 0 {
                    a_open = false;
                    b.shutdown().await?;
                } else {
                    b.write_all(&a_buf[..n]).await?;
                    to_b += n as u64;
                }
            }
            read = b.read(&mut b_buf), if b_open => {
                let n = read?;
                if n == 0 {
                    b_open = false;
                    a.shutdown().await?;
                } else {
                    a.write_all(&b_buf[..n]).await?;
                    to_a += n as u64;
                }
            }
            _ = &mut deadline, if idle_timeout_secs != 0 => {
                debug!(to_server = to_b, to_client = to_a, "idle timeout");
                return Err(RelayError::Timeout {
                    timeout_secs: idle_timeout_secs,
                });
            }
        }
        if idle_timeout_secs != 0 {
            deadline.as_mut().reset(Instant::now() + idle);
        }
    }
    debug!(to_server = to_b, to_client = to_a, "connection closed normally");
    Ok((to_b, to_a))
}
