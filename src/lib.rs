//! # streamnet
//!
//! Messaging engine for a peer-to-peer live video overlay. Nodes publish
//! segments under a stream id, other nodes subscribe to it, and nodes in
//! between relay the stream so each source only feeds its direct neighbours.
//!
//! ```text
//!   origin (A)               relay (B)                 leaf (C)
//! ┌─────────────┐        ┌──────────────┐        ┌──────────────┐
//! │ Broadcaster │──────▶ │   Relayer    │──────▶ │  Subscriber  │
//! │ ListenerSet │ frames │ ListenerSet  │ frames │  callback()  │
//! └─────────────┘        └──────────────┘        └──────────────┘
//!        ▲ SubscribeRequest     ▲ SubscribeRequest      │
//!        └──────────────────────┴───────────────────────┘
//! ```
//!
//! A subscription request travels towards the origin, creating a relayer at
//! every hop that does not own the stream. Data then flows back down the
//! same connections. `FinishStream` follows the data path down;
//! `CancelSubscription` follows the request path up.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamnet::{MemoryNetwork, Node, PeerId, RoutingTable, StreamId};
//!
//! # async fn demo() -> streamnet::Result<()> {
//! let network = MemoryNetwork::new();
//! let origin = Node::new(network.join("aa"), Arc::new(RoutingTable::new()));
//! let viewer = Node::new(network.join("bb"), Arc::new(RoutingTable::new().with_peer("aa")));
//! origin.spawn();
//!
//! let id = StreamId::for_peer(&PeerId::new("aa"), "live");
//! let handle = viewer
//!     .subscribe(&id, |seq_no, data, eof| println!("{seq_no} {} bytes eof={eof}", data.len()))
//!     .await?;
//!
//! origin.broadcast(&id, 0, &b"segment"[..]).await?;
//! origin.finish_broadcast(&id).await?;
//! handle.stopped().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod stats;
pub mod stream;
pub mod transport;

pub use error::{DecodeError, Error, ProtocolError, Result};
pub use node::{Node, NodeConfig, StreamRegistry};
pub use protocol::{Message, MessageTag, PeerId, StreamId};
pub use routing::{Routing, RoutingTable};
pub use stats::{FanoutStats, NodeStats};
pub use stream::{Broadcaster, Relayer, Subscriber, SubscriptionHandle};
pub use transport::{FramedStream, MemoryNetwork, TcpTransport, Transport, TransportConfig};
