//! SOCKS front end that tunnels every proxied connection over the mesh.

pub mod config;
pub mod listener;
pub mod relay;
pub mod socks;

pub use config::{ConfigError, ProxyConfig, RadioConfig};
pub use listener::ProxyListener;
pub use relay::{DirectUpstream, MeshUpstream, ProxyRelay, RelayConfig, RelayError, Upstream};
pub use socks::{HandshakeError, SocksCommand, SocksRequest, SocksVersion};
