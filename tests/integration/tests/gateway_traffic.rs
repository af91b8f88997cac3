//! Non-stream traffic between a node and the gateway: SMS, text and
//! transaction broadcasts.

use std::sync::Arc;

use bytes::Bytes;
use core_framing::{
    MeshData, Message, Network, Payload, SmsBody, TxReassembled, TxReassembler, GATEWAY_GID,
};
use core_mesh::{MemoryMesh, MeshConfig, MeshContext, MeshSender, OutboundPacket, TxIdSource};
use tokio::sync::mpsc;

const LOCAL_GID: u64 = 46_725_174_784;

struct FixedTxId([u8; 32]);

impl TxIdSource for FixedTxId {
    fn txid(&self, _raw: &[u8]) -> [u8; 32] {
        self.0
    }
}

#[tokio::test]
async fn inbound_gateway_sms_and_text_are_attributed_to_phone_numbers() {
    let mesh = MemoryMesh::new();
    let (node, inbound) = mesh.attach(LOCAL_GID);
    let (gateway, _gw_rx) = mesh.attach(GATEWAY_GID);
    let ctx = MeshContext::new(MeshConfig::default(), Arc::new(node));
    let (others_tx, mut others) = mpsc::unbounded_channel();
    ctx.spawn_dispatcher(inbound, Some(others_tx));

    let sms = Payload::Sms(SmsBody {
        phone_number: "+15551234567".into(),
        text: "hello".into(),
    });
    gateway
        .send(OutboundPacket {
            receiver_gid: LOCAL_GID,
            data: MeshData::Binary(Bytes::from(sms.encode().unwrap())),
            encrypt: false,
        })
        .await
        .unwrap();
    gateway
        .send(OutboundPacket {
            receiver_gid: LOCAL_GID,
            data: MeshData::Text("+15557654321 running late".into()),
            encrypt: false,
        })
        .await
        .unwrap();

    match others.recv().await {
        Some(Message::Sms(m)) => {
            assert_eq!(m.sender_gid, 15_551_234_567);
            assert_eq!(m.receiver_gid, LOCAL_GID);
            assert_eq!(m.text, "hello");
        }
        other => panic!("expected sms, got {other:?}"),
    }
    match others.recv().await {
        Some(Message::Text(t)) => {
            assert_eq!(t.sender_gid, 15_557_654_321);
            assert_eq!(t.text, "running late");
        }
        other => panic!("expected text, got {other:?}"),
    }
}

#[tokio::test]
async fn transaction_broadcast_reaches_gateway_intact() {
    let mesh = MemoryMesh::new();
    let (node, _inbound) = mesh.attach(LOCAL_GID);
    let (_gateway, mut gw_rx) = mesh.attach(GATEWAY_GID);
    let txid = [0xab; 32];
    let ctx = MeshContext::with_txid_source(
        MeshConfig::default(),
        Arc::new(node),
        Box::new(FixedTxId(txid)),
    );

    let raw: Vec<u8> = (0..500u32).map(|i| (i * 7 % 256) as u8).collect();
    let tx_hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    let broadcast = ctx.broadcast_transaction(&tx_hex, Network::Testnet).unwrap();
    assert_eq!(broadcast.txid, txid);
    let count = broadcast.segment_count();
    assert!(broadcast.failures().await.is_empty());

    let mut reassembler = TxReassembler::new();
    let mut first_count = None;
    let mut outcome = TxReassembled::Pending;
    for _ in 0..count {
        let packet = gw_rx.recv().await.unwrap();
        assert_eq!(packet.sender_gid, LOCAL_GID);
        let MeshData::Binary(bytes) = packet.data else {
            panic!("expected binary")
        };
        assert!(bytes.len() <= MeshConfig::default().tx_packet_bytes);
        let Payload::TxSegment(segment) = Payload::decode(&bytes).unwrap() else {
            panic!("expected transaction segment")
        };
        if let Some(open) = &segment.open {
            first_count = Some(usize::from(open.count));
        }
        outcome = reassembler.on_segment(&segment);
    }
    assert_eq!(first_count, Some(count));
    assert_eq!(
        outcome,
        TxReassembled::Complete {
            txid,
            network: Network::Testnet,
            raw: Bytes::from(raw),
        }
    );
}
