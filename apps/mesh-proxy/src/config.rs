//! Proxy configuration: optional TOML file, then environment overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use core_mesh::MeshConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::relay::RelayConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_port: u16,
    /// None or 0 accepts without bound.
    pub max_connections: Option<usize>,
    /// This node's id on the mesh.
    pub local_gid: u64,
    pub handshake_timeout_secs: u64,
    /// A proxied connection with no data either way for this long is closed; 0 disables.
    pub idle_timeout_secs: u64,
    /// Daily-rotated log files go here; stdout when unset.
    pub log_dir: Option<PathBuf>,
    pub radio: RadioConfig,
    pub mesh: MeshConfig,
}

/// Datagram link to the process that owns the radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub bind: SocketAddr,
    pub bridge: SocketAddr,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4280)),
            bridge: SocketAddr::from(([127, 0, 0, 1], 4281)),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: 8888,
            max_connections: None,
            local_gid: 46_725_174_784,
            handshake_timeout_secs: 30,
            idle_timeout_secs: 600,
            log_dir: None,
            radio: RadioConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Reads `path` when given, then applies `MESH_PROXY_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Env overrides: MESH_PROXY_PORT, MESH_PROXY_MAX_CONNECTIONS, MESH_PROXY_LOCAL_GID,
    /// MESH_PROXY_GATEWAY_GID, MESH_PROXY_MAX_PACKET, MESH_PROXY_LOOPBACK_BASE,
    /// MESH_PROXY_ENCRYPT, MESH_PROXY_LOG_DIR, MESH_PROXY_RADIO_BIND, MESH_PROXY_RADIO_BRIDGE.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parsed(&var, "MESH_PROXY_PORT") {
            self.listen_port = v;
        }
        if let Some(v) = var("MESH_PROXY_MAX_CONNECTIONS") {
            match v.trim() {
                "" | "0" | "unbounded" => self.max_connections = None,
                n => match n.parse() {
                    Ok(n) => self.max_connections = Some(n),
                    Err(_) => warn!(value = %v, "ignoring unparseable MESH_PROXY_MAX_CONNECTIONS"),
                },
            }
        }
        if let Some(v) = parsed(&var, "MESH_PROXY_LOCAL_GID") {
            self.local_gid = v;
        }
        if let Some(v) = parsed(&var, "MESH_PROXY_GATEWAY_GID") {
            self.mesh.gateway_gid = v;
        }
        if let Some(v) = parsed(&var, "MESH_PROXY_MAX_PACKET") {
            self.mesh.stream_packet_bytes = v;
        }
        if let Some(v) = parsed(&var, "MESH_PROXY_LOOPBACK_BASE") {
            self.mesh.loopback_base_port = v;
        }
        if let Some(v) = var("MESH_PROXY_ENCRYPT") {
            self.mesh.encrypt = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = var("MESH_PROXY_LOG_DIR") {
            self.log_dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = parsed(&var, "MESH_PROXY_RADIO_BIND") {
            self.radio.bind = v;
        }
        if let Some(v) = parsed(&var, "MESH_PROXY_RADIO_BRIDGE") {
            self.radio.bridge = v;
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.listen_port))
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            handshake_timeout_secs: self.handshake_timeout_secs,
            idle_timeout_secs: self.idle_timeout_secs,
        }
    }
}

fn parsed<T, F>(var: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
