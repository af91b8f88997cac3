//! SOCKS client -> proxy relay -> mesh bridge -> simulated gateway and back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use core_framing::{
    Destination, MeshData, Payload, Reassembled, Reassembler, StreamChunk, StreamId,
    StreamSegmenter, GATEWAY_GID,
};
use core_mesh::{MemoryMesh, MemoryNode, MeshConfig, MeshContext, MeshPacket, MeshSender, OutboundPacket};
use mesh_proxy::{MeshUpstream, ProxyListener, RelayConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const LOCAL_GID: u64 = 46_725_174_784;
const GATEWAY_PACKET: usize = 60;

/// What the simulated gateway saw for one stream.
#[derive(Debug, Default, Clone)]
struct Seen {
    destination: Option<Destination>,
    request: Vec<u8>,
    segments: usize,
    closed: bool,
}

/// Stands in for the remote gateway: reassembles requests per stream and
/// answers each complete request with `respond(request)`, then a close.
struct Gateway {
    node: MemoryNode,
    inbox: mpsc::UnboundedReceiver<MeshPacket>,
    respond: fn(&Destination, &[u8]) -> Option<Vec<u8>>,
}

impl Gateway {
    async fn run(mut self, report: mpsc::UnboundedSender<(StreamId, Seen)>) {
        let mut reassembler = Reassembler::new();
        let mut streams: HashMap<StreamId, Seen> = HashMap::new();
        while let Some(packet) = self.inbox.recv().await {
            let MeshData::Binary(bytes) = packet.data else {
                continue;
            };
            let Ok(Payload::StreamChunk(chunk)) = Payload::decode(&bytes) else {
                continue;
            };
            let id = chunk.stream_id;
            let seen = streams.entry(id).or_default();
            seen.segments += 1;
            if chunk.destination.is_some() {
                seen.destination = chunk.destination.clone();
            }
            match reassembler.on_chunk(&chunk) {
                Reassembled::Pending => {}
                Reassembled::Complete(data) => {
                    seen.request.extend_from_slice(&data);
                    let Some(dest) = seen.destination.clone() else {
                        continue;
                    };
                    if let Some(response) = (self.respond)(&dest, &seen.request) {
                        self.reply(packet.sender_gid, id, Bytes::from(response)).await;
                        let _ = report.send((id, seen.clone()));
                    }
                }
                Reassembled::Closed => {
                    seen.closed = true;
                    let _ = report.send((id, seen.clone()));
                }
            }
        }
    }

    async fn reply(&self, to: u64, id: StreamId, response: Bytes) {
        let chunks = StreamSegmenter::new(id, None, response, GATEWAY_PACKET)
            .unwrap()
            .chain(std::iter::once(StreamChunk::close(id)));
        for chunk in chunks {
            self.node
                .send(OutboundPacket {
                    receiver_gid: to,
                    data: MeshData::Binary(Bytes::from(chunk.encode().unwrap())),
                    encrypt: false,
                })
                .await
                .unwrap();
        }
    }
}

struct Harness {
    proxy: SocketAddr,
    ctx: MeshContext,
    reports: mpsc::UnboundedReceiver<(StreamId, Seen)>,
    _stop: oneshot::Sender<()>,
}

async fn harness(respond: fn(&Destination, &[u8]) -> Option<Vec<u8>>) -> Harness {
    let mesh = MemoryMesh::new();
    let (node, inbound) = mesh.attach(LOCAL_GID);
    let (gw_node, gw_inbox) = mesh.attach(GATEWAY_GID);

    let config = MeshConfig {
        loopback_base_port: 0,
        ..MeshConfig::default()
    };
    let ctx = MeshContext::new(config, Arc::new(node));
    ctx.spawn_dispatcher(inbound, None);

    let (report_tx, reports) = mpsc::unbounded_channel();
    tokio::spawn(
        Gateway {
            node: gw_node,
            inbox: gw_inbox,
            respond,
        }
        .run(report_tx),
    );

    let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), None, RelayConfig::default())
        .await
        .unwrap();
    let proxy = listener.local_addr().unwrap();
    let (stop, stop_rx) = oneshot::channel::<()>();
    let upstream_ctx = ctx.clone();
    tokio::spawn(listener.serve(
        move || MeshUpstream::new(&upstream_ctx),
        async {
            let _ = stop_rx.await;
        },
    ));

    Harness {
        proxy,
        ctx,
        reports,
        _stop: stop,
    }
}

async fn socks5_connect(proxy: SocketAddr, host: [u8; 4], port: u16) -> TcpStream {
    let mut c = TcpStream::connect(proxy).await.unwrap();
    let mut req = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&host);
    req.extend_from_slice(&port.to_be_bytes());
    c.write_all(&req).await.unwrap();
    let mut replies = [0u8; 12];
    c.read_exact(&mut replies).await.unwrap();
    assert_eq!(&replies[..4], &[0x05, 0x00, 0x05, 0x00], "SOCKS5 connect refused");
    c
}

fn http_response(dest: &Destination, request: &[u8]) -> Option<Vec<u8>> {
    if !request.ends_with(b"\r\n") {
        return None;
    }
    let body: String = (0..40)
        .map(|i| format!("line {i:02} from {}:{}\n", dest.host, dest.port))
        .collect();
    Some(format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body).into_bytes())
}

#[tokio::test]
async fn get_request_round_trip() {
    let mut h = harness(http_response).await;
    let mut client = socks5_connect(h.proxy, [10, 0, 0, 5], 9000).await;

    client.write_all(b"GET /\r\n").await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(10), client.read_to_end(&mut response))
        .await
        .expect("response within 10s")
        .unwrap();

    let expected = http_response(&Destination::new("10.0.0.5", 9000), b"GET /\r\n").unwrap();
    assert!(expected.len() > 10 * GATEWAY_PACKET, "response must span many segments");
    assert_eq!(response, expected);

    let (id, seen) = h.reports.recv().await.unwrap();
    assert_eq!(id, StreamId::derive(LOCAL_GID, "10.0.0.5", 9000));
    assert_eq!(seen.destination, Some(Destination::new("10.0.0.5", 9000)));
    assert_eq!(seen.request, b"GET /\r\n");

    // the bridge tears down its registry entry after the remote close
    timeout(Duration::from_secs(5), async {
        while h.ctx.registry().is_registered(&id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream deregistered");
}

#[tokio::test]
async fn client_close_reaches_gateway() {
    let mut h = harness(|_, _| None).await;
    let mut client = socks5_connect(h.proxy, [192, 168, 1, 20], 80).await;
    client.write_all(b"partial request").await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    let (id, seen) = timeout(Duration::from_secs(10), h.reports.recv())
        .await
        .expect("close within 10s")
        .unwrap();
    assert_eq!(id, StreamId::derive(LOCAL_GID, "192.168.1.20", 80));
    assert!(seen.closed);
    assert_eq!(seen.request, b"partial request");
}

#[tokio::test]
async fn concurrent_streams_stay_separate() {
    let h = harness(http_response).await;
    let proxy = h.proxy;
    let mut tasks = Vec::new();
    for port in [8001u16, 8002, 8003] {
        tasks.push(tokio::spawn(async move {
            let mut client = socks5_connect(proxy, [10, 0, 0, 7], port).await;
            client.write_all(b"GET /\r\n").await.unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            (port, response)
        }));
    }
    for task in tasks {
        let (port, response) = timeout(Duration::from_secs(10), task)
            .await
            .expect("response within 10s")
            .unwrap();
        let expected = http_response(&Destination::new("10.0.0.7", port), b"GET /\r\n").unwrap();
        assert_eq!(response, expected, "stream for port {port}");
    }
}

#[tokio::test]
async fn oversized_host_gets_socks_failure() {
    let h = harness(http_response).await;
    let host = format!("{}.example.com", "a".repeat(120));
    let mut c = TcpStream::connect(h.proxy).await.unwrap();
    let mut req = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&443u16.to_be_bytes());
    c.write_all(&req).await.unwrap();

    let mut replies = [0u8; 12];
    c.read_exact(&mut replies).await.unwrap();
    assert_eq!(&replies[..2], &[0x05, 0x00]);
    assert_eq!(replies[3], 0x01, "general failure");
    assert!(h.ctx.registry().is_empty());
}
