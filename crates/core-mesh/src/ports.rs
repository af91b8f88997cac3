//! Loopback port allocation for per-connection bridge listeners.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use tokio::net::TcpListener;

const MAX_ATTEMPTS: usize = 64;

/// Hands out ports from a shared counter; each caller gets a distinct one.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: AtomicU16,
}

impl PortAllocator {
    /// `base == 0` lets the OS pick every port.
    pub fn new(base: u16) -> Self {
        Self {
            base,
            next: AtomicU16::new(base),
        }
    }

    fn next_port(&self) -> u16 {
        let port = self.next.fetch_add(1, Ordering::Relaxed);
        if port == 0 || port < self.base {
            // wrapped past u16::MAX
            self.next.store(self.base.saturating_add(1), Ordering::Relaxed);
            return self.base;
        }
        port
    }

    /// Binds a fresh listener on 127.0.0.1, skipping ports already taken.
    pub async fn bind_loopback(&self) -> io::Result<TcpListener> {
        if self.base == 0 {
            return TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await;
        }
        let mut last_err = None;
        for _ in 0..MAX_ATTEMPTS {
            let port = self.next_port();
            match TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    log::debug!("loopback port {} in use, trying next", port);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)))
    }
}
