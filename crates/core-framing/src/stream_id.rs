use sha2::{Digest, Sha256};
use std::fmt;

/// 8-byte identifier grouping every segment of one proxied connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId([u8; StreamId::LEN]);

impl StreamId {
    pub const LEN: usize = 8;

    /// First 8 bytes of SHA-256 over `"<sender_gid>:<host>:<port>"`.
    pub fn derive(sender_gid: u64, host: &str, port: u16) -> Self {
        let digest = Sha256::digest(format!("{sender_gid}:{host}:{port}").as_bytes());
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(&digest[..Self::LEN]);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LEN]>::try_from(bytes).ok().map(Self)
    }

    pub const fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({self})")
    }
}
