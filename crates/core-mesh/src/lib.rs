//! Mesh side of the tunnel: transport boundary, stream registry, inbound
//! dispatch and the per-connection tunnel bridge.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use core_mesh::{MemoryMesh, MeshConfig, MeshContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mesh = MemoryMesh::new();
//! let (node, inbound) = mesh.attach(46_725_174_784);
//! let ctx = MeshContext::new(MeshConfig::default(), Arc::new(node));
//! ctx.spawn_dispatcher(inbound, None);
//!
//! let mut bridge = ctx.new_bridge();
//! let loopback = bridge.open("example.com", 80).await?;
//! // connect to `loopback` and talk to example.com:80 through the gateway
//! # let _ = loopback;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod broadcast;
mod context;
mod dispatcher;
pub mod memory;
mod ports;
pub mod registry;
pub mod transport;
pub mod udp;

pub use bridge::{BridgeError, BridgeState, MeshTunnelBridge};
pub use broadcast::{Broadcast, BroadcastError, Sha256dTxId, TxIdSource};
pub use context::{MeshConfig, MeshContext, SmsError};
pub use memory::{MemoryMesh, MemoryNode};
pub use ports::PortAllocator;
pub use registry::{Registration, RegistryError, StreamEvent, StreamRegistry};
pub use transport::{MeshPacket, MeshSender, OutboundPacket, SendReceipt, TransportSendError};
pub use udp::UdpMesh;
