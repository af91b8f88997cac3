use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use core_framing::{
    EncodeError, MeshData, Message, Payload, SmsBody, GATEWAY_GID, STREAM_PACKET_BYTES,
    TX_PACKET_BYTES,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::MeshTunnelBridge;
use crate::broadcast::{Sha256dTxId, TxIdSource};
use crate::dispatcher;
use crate::ports::PortAllocator;
use crate::registry::StreamRegistry;
use crate::transport::{MeshPacket, MeshSender, OutboundPacket, SendReceipt};

/// Tunables shared by every bridge on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Receiver of every stream chunk and transaction segment.
    pub gateway_gid: u64,
    pub stream_packet_bytes: usize,
    pub tx_packet_bytes: usize,
    pub encrypt: bool,
    /// First loopback port handed to a bridge; 0 lets the OS choose.
    pub loopback_base_port: u16,
    /// How long a bridge waits for the relay to connect to its loopback port.
    pub accept_timeout_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            gateway_gid: GATEWAY_GID,
            stream_packet_bytes: STREAM_PACKET_BYTES,
            tx_packet_bytes: TX_PACKET_BYTES,
            encrypt: false,
            loopback_base_port: 1337,
            accept_timeout_secs: 10,
        }
    }
}

impl MeshConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }
}

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("sms needs a destination phone number")]
    EmptyPhoneNumber,

    #[error("sms body is empty")]
    EmptyText,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

struct ContextInner {
    config: MeshConfig,
    sender: Arc<dyn MeshSender>,
    registry: Arc<StreamRegistry>,
    ports: PortAllocator,
    txid_source: Box<dyn TxIdSource>,
}

/// Everything a bridge, the dispatcher and the outbound operations share.
///
/// Cheap to clone; one per node, handed to whoever needs it.
#[derive(Clone)]
pub struct MeshContext {
    inner: Arc<ContextInner>,
}

impl MeshContext {
    pub fn new(config: MeshConfig, sender: Arc<dyn MeshSender>) -> Self {
        Self::with_txid_source(config, sender, Box::new(Sha256dTxId))
    }

    pub fn with_txid_source(
        config: MeshConfig,
        sender: Arc<dyn MeshSender>,
        txid_source: Box<dyn TxIdSource>,
    ) -> Self {
        let ports = PortAllocator::new(config.loopback_base_port);
        Self {
            inner: Arc::new(ContextInner {
                config,
                sender,
                registry: StreamRegistry::new(),
                ports,
                txid_source,
            }),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn local_gid(&self) -> u64 {
        self.inner.sender.local_gid()
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.inner.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    pub(crate) fn txid_source(&self) -> &dyn TxIdSource {
        self.inner.txid_source.as_ref()
    }

    /// Encodes `payload` and hands it to the radio without waiting.
    pub fn submit(&self, receiver_gid: u64, payload: &Payload) -> Result<SendReceipt, EncodeError> {
        let bytes = payload.encode()?;
        Ok(self.send_data(receiver_gid, MeshData::Binary(Bytes::from(bytes))))
    }

    pub fn send_text(&self, receiver_gid: u64, text: &str) -> SendReceipt {
        self.send_data(receiver_gid, MeshData::Text(text.to_string()))
    }

    /// Asks `receiver_gid` (normally the gateway) to deliver an SMS to `phone_number`.
    pub fn send_sms(
        &self,
        receiver_gid: u64,
        phone_number: &str,
        text: &str,
    ) -> Result<SendReceipt, SmsError> {
        if phone_number.trim().is_empty() {
            return Err(SmsError::EmptyPhoneNumber);
        }
        if text.is_empty() {
            return Err(SmsError::EmptyText);
        }
        let body = SmsBody {
            phone_number: phone_number.to_string(),
            text: text.to_string(),
        };
        Ok(self.submit(receiver_gid, &Payload::Sms(body))?)
    }

    fn send_data(&self, receiver_gid: u64, data: MeshData) -> SendReceipt {
        self.inner.sender.send(OutboundPacket {
            receiver_gid,
            data,
            encrypt: self.inner.config.encrypt,
        })
    }

    pub fn new_bridge(&self) -> MeshTunnelBridge {
        MeshTunnelBridge::new(self.clone())
    }

    /// Routes inbound packets: stream chunks to the registry, everything else to `others`.
    pub fn spawn_dispatcher(
        &self,
        inbound: mpsc::UnboundedReceiver<MeshPacket>,
        others: Option<mpsc::UnboundedSender<Message>>,
    ) -> JoinHandle<()> {
        tokio::spawn(dispatcher::run(self.registry().clone(), inbound, others))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMesh;
    use std::time::SystemTime;

    #[tokio::test]
    async fn sms_goes_out_as_one_envelope() {
        let mesh = MemoryMesh::new();
        let (node, _rx) = mesh.attach(46_725_174_784);
        let (_gw, mut gw_rx) = mesh.attach(GATEWAY_GID);
        let ctx = MeshContext::new(MeshConfig::default(), Arc::new(node));

        let receipt = ctx.send_sms(GATEWAY_GID, "+15551234567", "on my way").unwrap();
        assert_eq!(receipt.await, Ok(()));

        let pkt = gw_rx.recv().await.unwrap();
        let MeshData::Binary(bytes) = &pkt.data else {
            panic!("expected binary packet")
        };
        assert_eq!(
            Payload::decode(bytes).unwrap(),
            Payload::Sms(SmsBody {
                phone_number: "+15551234567".into(),
                text: "on my way".into(),
            })
        );
        // decoded by a peer, the sender stays the packet sender
        let packet = MeshPacket {
            sent_at: SystemTime::now(),
            ..pkt
        };
        assert!(matches!(Message::decode(&packet), Ok(Message::Sms(m)) if m.sender_gid == 46_725_174_784));
    }

    #[test]
    fn sms_validation() {
        let mesh = MemoryMesh::new();
        let (node, _rx) = mesh.attach(1);
        let ctx = MeshContext::new(MeshConfig::default(), Arc::new(node));
        assert!(matches!(
            ctx.send_sms(GATEWAY_GID, " ", "x"),
            Err(SmsError::EmptyPhoneNumber)
        ));
        assert!(matches!(
            ctx.send_sms(GATEWAY_GID, "+1555", ""),
            Err(SmsError::EmptyText)
        ));
    }

    #[test]
    fn config_defaults() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.gateway_gid, 555_555_555);
        assert_eq!(cfg.stream_packet_bytes, 150);
        assert_eq!(cfg.tx_packet_bytes, 200);
        assert_eq!(cfg.loopback_base_port, 1337);
        assert!(!cfg.encrypt);
    }
}
