//! In-process transport
//!
//! Nodes join a shared [`MemoryNetwork`] under a peer id. Opening a stream
//! creates a `tokio::io::duplex` pipe and hands the far end to the target
//! node's accept queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::config::TransportConfig;
use super::stream::FramedStream;
use super::Transport;
use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// Shared hub connecting in-memory transports
pub struct MemoryNetwork {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Arc<FramedStream>>>>,
    config: TransportConfig,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Attach a node to the network
    ///
    /// Joining again under the same id replaces the previous registration.
    pub fn join(self: &Arc<Self>, peer: impl Into<PeerId>) -> Arc<MemoryTransport> {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();

        if self.peers.lock().insert(peer.clone(), tx).is_some() {
            tracing::debug!(peer = %peer, "Memory peer re-joined");
        }

        Arc::new(MemoryTransport {
            local: peer,
            network: Arc::clone(self),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Detach a node; its accept loop ends
    pub fn leave(&self, peer: &PeerId) {
        self.peers.lock().remove(peer);
    }

    /// Peers currently attached
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().keys().cloned().collect()
    }

    fn connect(&self, from: &PeerId, to: &PeerId) -> Result<Arc<FramedStream>> {
        let acceptor = self
            .peers
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| Error::PeerUnreachable(to.clone()))?;

        let (near, far) = tokio::io::duplex(self.config.duplex_buffer_size);
        let max = self.config.max_frame_size;
        let local = Arc::new(FramedStream::from_io(to.clone(), near, max));
        let remote = Arc::new(FramedStream::from_io(from.clone(), far, max));

        acceptor
            .send(remote)
            .map_err(|_| Error::PeerUnreachable(to.clone()))?;

        tracing::trace!(from = %from, to = %to, "Memory stream opened");
        Ok(local)
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<FramedStream>>>,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    async fn open_stream(&self, peer: &PeerId) -> Result<Arc<FramedStream>> {
        self.network.connect(&self.local, peer)
    }

    async fn accept(&self) -> Result<Option<Arc<FramedStream>>> {
        Ok(self.incoming.lock().await.recv().await)
    }
}
