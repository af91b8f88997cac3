//! Inbound packet loop.

use std::sync::Arc;

use core_framing::Message;
use tokio::sync::mpsc;

use crate::registry::{Delivery, StreamRegistry};
use crate::transport::MeshPacket;

/// Runs until the transport closes `inbound`. Undecodable packets are
/// logged and dropped; they never end the loop.
pub async fn run(
    registry: Arc<StreamRegistry>,
    mut inbound: mpsc::UnboundedReceiver<MeshPacket>,
    others: Option<mpsc::UnboundedSender<Message>>,
) {
    let mut others = others;
    while let Some(packet) = inbound.recv().await {
        let message = match Message::decode(&packet) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("dropping packet from gid {}: {}", packet.sender_gid, e);
                continue;
            }
        };
        match message {
            Message::StreamChunk(chunk) => match registry.deliver(&chunk) {
                Delivery::Unknown => {
                    log::debug!(
                        "no open stream {} for chunk {}/{}",
                        chunk.stream_id,
                        chunk.index,
                        chunk.count
                    );
                }
                Delivery::Buffered | Delivery::Delivered | Delivery::Closed => {}
            },
            other => {
                if let Some(tx) = &others {
                    if tx.send(other).is_err() {
                        log::debug!("message consumer went away");
                        others = None;
                    }
                } else {
                    log::debug!("no consumer for {}", kind(&other));
                }
            }
        }
    }
    log::info!("mesh inbound channel closed, dispatcher stopping");
}

fn kind(m: &Message) -> &'static str {
    match m {
        Message::Text(_) => "text message",
        Message::Sms(_) => "sms",
        Message::StreamChunk(_) => "stream chunk",
        Message::TxSegment(_) => "transaction segment",
    }
}
