//! Peer-to-peer transport boundary
//!
//! The messaging engine only needs three things from the network: its own
//! identity, a way to open a stream to a peer, and a queue of streams other
//! peers opened to it. Peer discovery, identity generation and encryption
//! all live behind this trait.

pub mod config;
pub mod memory;
pub mod stream;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::PeerId;

pub use config::TransportConfig;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use stream::FramedStream;
pub use tcp::TcpTransport;

/// Connection-oriented transport between peers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of this node
    fn local_peer_id(&self) -> &PeerId;

    /// Open a new stream to `peer`
    async fn open_stream(&self, peer: &PeerId) -> Result<Arc<FramedStream>>;

    /// Wait for the next stream opened by a remote peer.
    ///
    /// Returns `Ok(None)` once the transport has shut down.
    async fn accept(&self) -> Result<Option<Arc<FramedStream>>>;
}
