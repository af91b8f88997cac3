//! Accept loop: one relay task per inbound proxy connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::relay::{ProxyRelay, RelayConfig, RelayError, Upstream};

pub struct ProxyListener {
    listener: TcpListener,
    limit: Option<Arc<Semaphore>>,
    relay_config: RelayConfig,
}

impl ProxyListener {
    /// `max_connections` of `None` or `Some(0)` accepts without bound.
    pub async fn bind(
        addr: SocketAddr,
        max_connections: Option<usize>,
        relay_config: RelayConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            limit: max_connections
                .filter(|&n| n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
            relay_config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `shutdown` resolves. Connections already running are
    /// left to finish on their own.
    pub async fn serve<F, U, S>(self, make_upstream: F, shutdown: S) -> io::Result<()>
    where
        F: Fn() -> U,
        U: Upstream + 'static,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(addr = %self.listener.local_addr()?, "proxy listener accepting");
        loop {
            let permit = match &self.limit {
                Some(sem) => tokio::select! {
                    _ = &mut shutdown => break,
                    permit = sem.clone().acquire_owned() => match permit {
                        Ok(p) => Some(p),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            debug!(%peer, "client connected");
            let relay = ProxyRelay::new(make_upstream(), self.relay_config.clone());
            tokio::spawn(async move {
                let _permit = permit;
                match relay.run(stream).await {
                    Ok((to_server, to_client)) => {
                        info!(%peer, to_server, to_client, "connection finished");
                    }
                    Err(RelayError::Handshake(e)) => {
                        debug!(%peer, error = %e, "handshake rejected");
                    }
                    Err(e) => warn!(%peer, error = %e, "connection failed"),
                }
            });
        }
        info!("proxy listener stopped accepting");
        Ok(())
    }
}
