//! In-process mesh for tests and local loopback runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::transport::{MeshPacket, MeshSender, OutboundPacket, SendReceipt, TransportSendError};

type Inboxes = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<MeshPacket>>>>;

/// Shared medium every attached node hears on.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inboxes: Inboxes,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins `gid` to the mesh. Re-attaching a gid replaces its inbox.
    pub fn attach(&self, gid: u64) -> (MemoryNode, mpsc::UnboundedReceiver<MeshPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.insert(gid, tx);
        }
        let node = MemoryNode {
            gid,
            inboxes: self.inboxes.clone(),
        };
        (node, rx)
    }

    pub fn detach(&self, gid: u64) {
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.remove(&gid);
        }
    }
}

#[derive(Clone)]
pub struct MemoryNode {
    gid: u64,
    inboxes: Inboxes,
}

impl MeshSender for MemoryNode {
    fn local_gid(&self) -> u64 {
        self.gid
    }

    fn send(&self, packet: OutboundPacket) -> SendReceipt {
        let inbox = match self.inboxes.lock() {
            Ok(inboxes) => inboxes.get(&packet.receiver_gid).cloned(),
            Err(_) => None,
        };
        let Some(inbox) = inbox else {
            return SendReceipt::ready(Err(TransportSendError::NotConnected(packet.receiver_gid)));
        };
        let receiver_gid = packet.receiver_gid;
        let delivered = inbox.send(MeshPacket {
            sender_gid: self.gid,
            receiver_gid,
            sent_at: SystemTime::now(),
            data: packet.data,
        });
        SendReceipt::ready(delivered.map_err(|_| TransportSendError::NotConnected(receiver_gid)))
    }
}
