//! Node: registry, dispatch and the local API
//!
//! A [`Node`] ties a transport and a routing table to a [`StreamRegistry`].
//! [`Node::run`] accepts inbound streams and dispatches their frames; the
//! remaining methods are what a local application calls to publish,
//! subscribe and exchange metadata.

pub mod config;
pub mod dispatch;
pub mod metadata;
pub mod registry;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Message, PeerId, StreamId};
use crate::routing::Routing;
use crate::stats::NodeStats;
use crate::stream::SubscriptionHandle;
use crate::transport::Transport;

pub use config::NodeConfig;
pub use metadata::{MetadataRegistry, TranscodeHandler};
pub use registry::StreamRegistry;

/// One peer in the overlay
#[derive(Clone)]
pub struct Node {
    registry: Arc<StreamRegistry>,
}

impl Node {
    /// Create a node with default configuration
    pub fn new(transport: Arc<dyn Transport>, routing: Arc<dyn Routing>) -> Self {
        Self::with_config(transport, routing, NodeConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        routing: Arc<dyn Routing>,
        config: NodeConfig,
    ) -> Self {
        Self {
            registry: StreamRegistry::new(transport, routing, config),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.registry.local_peer()
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Accept inbound streams until the transport shuts down
    ///
    /// Each accepted stream gets its own dispatch task.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(peer = %self.peer_id(), "Node accepting streams");

        loop {
            match self.registry.transport().accept().await {
                Ok(Some(stream)) => {
                    tokio::spawn(dispatch::serve_stream(Arc::clone(&self.registry), stream));
                }
                Ok(None) => {
                    tracing::info!(peer = %self.peer_id(), "Transport closed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept stream");
                }
            }
        }
    }

    /// Run until `shutdown` completes
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!(peer = %self.peer_id(), "Shutdown signal received");
                Ok(())
            }
            result = self.run() => result,
        }
    }

    /// Run the accept loop on a background task
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    /// Publish a segment on a locally originated stream
    ///
    /// The broadcaster is created on first use.
    pub async fn broadcast(
        &self,
        stream_id: &StreamId,
        seq_no: u64,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        self.registry
            .get_broadcaster(stream_id)
            .await
            .broadcast(seq_no, data)
            .await
    }

    /// Finish a locally originated stream
    pub async fn finish_broadcast(&self, stream_id: &StreamId) -> Result<()> {
        let broadcaster = self
            .registry
            .broadcaster(stream_id)
            .await
            .ok_or_else(|| ProtocolError::NoPublisher(stream_id.clone()))?;

        broadcaster.finish().await
    }

    /// Subscribe to a stream originated elsewhere
    ///
    /// See [`Subscriber::subscribe`](crate::stream::Subscriber::subscribe)
    /// for the callback contract.
    pub async fn subscribe<F>(&self, stream_id: &StreamId, callback: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(u64, Bytes, bool) + Send + 'static,
    {
        let subscriber = self.registry.get_subscriber(stream_id).await;

        match subscriber.subscribe(callback).await {
            Ok(handle) => Ok(handle),
            Err(e @ Error::AlreadySubscribed(_)) => Err(e),
            Err(e) => {
                // Leave no idle subscriber behind for a failed attempt
                self.registry
                    .unregister_subscriber(stream_id, &subscriber)
                    .await;
                Err(e)
            }
        }
    }

    /// Send a transcode report to `peer` for `stream_id`
    pub async fn send_transcode_response(
        &self,
        peer: &PeerId,
        stream_id: &StreamId,
        result: BTreeMap<String, String>,
    ) -> Result<()> {
        let stream = self.registry.transport().open_stream(peer).await?;
        let sent = stream
            .send(&Message::TranscodeResponse {
                stream_id: stream_id.clone(),
                result,
            })
            .await;
        stream.close().await;
        sent
    }

    /// Call `handler` whenever a transcode report for `stream_id` arrives
    pub fn register_transcode_response_handler<F>(&self, stream_id: &StreamId, handler: F)
    where
        F: Fn(BTreeMap<String, String>) + Send + Sync + 'static,
    {
        self.registry
            .metadata()
            .register_transcode_handler(stream_id.clone(), handler);
    }

    /// Publish (or replace) a master playlist under `name`
    ///
    /// `name` is the id of the stream the playlist describes. Its broadcaster
    /// is created here if needed, so subscribers attach locally even before
    /// the first segment is published.
    pub async fn update_master_playlist(&self, name: &str, playlist: impl Into<Bytes>) {
        let playlist = playlist.into();
        self.registry.get_broadcaster(&StreamId::new(name)).await;

        tracing::debug!(name = name, size = playlist.len(), "Master playlist updated");
        self.registry.metadata().update_playlist(name, playlist);
    }

    /// Fetch the master playlist `name` published by `peer`
    ///
    /// The receiver yields `Some(playlist)`, or `None` if the peer has no
    /// playlist under that name. It fails with `RecvError` if the request
    /// could not be answered within the configured request timeout.
    pub async fn get_master_playlist(
        &self,
        peer: &PeerId,
        name: &str,
    ) -> Result<oneshot::Receiver<Option<Bytes>>> {
        let (tx, rx) = oneshot::channel();

        if peer == self.peer_id() {
            let _ = tx.send(self.registry.metadata().playlist(name));
            return Ok(rx);
        }

        let stream = self.registry.transport().open_stream(peer).await?;
        let request = Message::MasterPlaylistRequest {
            node_id: peer.clone(),
            name: name.to_string(),
        };
        if let Err(e) = stream.send(&request).await {
            stream.close().await;
            return Err(e);
        }

        let registry = Arc::clone(&self.registry);
        let timeout = registry.config().request_timeout;
        let peer = peer.clone();

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, stream.receive()).await {
                Ok(Ok(Message::MasterPlaylistUpdate {
                    node_id,
                    name,
                    playlist,
                })) => {
                    let found = registry.metadata().store_remote(node_id, name, playlist);
                    let _ = tx.send(found);
                }
                Ok(Ok(other)) => {
                    tracing::warn!(peer = %peer, tag = ?other.tag(), "Unexpected playlist reply");
                }
                Ok(Err(e)) => {
                    tracing::warn!(peer = %peer, error = %e, "Playlist request failed");
                }
                Err(_) => {
                    tracing::warn!(peer = %peer, "Playlist request timed out");
                }
            }
            stream.close().await;
        });

        Ok(rx)
    }

    pub async fn stats(&self) -> NodeStats {
        self.registry.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingTable;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    fn nodes() -> (Node, Node) {
        let network = MemoryNetwork::new();
        let n1 = Node::new(network.join("n1"), Arc::new(RoutingTable::new().with_peer("n2")));
        let n2 = Node::new(network.join("n2"), Arc::new(RoutingTable::new().with_peer("n1")));
        (n1, n2)
    }

    #[tokio::test]
    async fn test_finish_unknown_broadcast() {
        let (n1, _n2) = nodes();

        let err = n1.finish_broadcast(&StreamId::new("n1strm")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::NoPublisher(_))));
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_subscriber() {
        let (n1, _n2) = nodes();

        let err = n1
            .subscribe(&StreamId::new("zzstrm"), |_, _, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::NoSource(_))));
        assert_eq!(n1.registry().subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_local_master_playlist() {
        let (n1, _n2) = nodes();
        n1.update_master_playlist("test", Bytes::from_static(b"#EXTM3U"))
            .await;

        let rx = n1.get_master_playlist(&PeerId::new("n1"), "test").await.unwrap();
        assert_eq!(rx.await.unwrap(), Some(Bytes::from_static(b"#EXTM3U")));
    }

    #[tokio::test]
    async fn test_remote_master_playlist_not_found() {
        let (n1, n2) = nodes();
        n1.spawn();

        let rx = n2.get_master_playlist(&PeerId::new("n1"), "missing").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap();
        assert_eq!(reply.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (n1, _n2) = nodes();
        let (tx, rx) = oneshot::channel::<()>();

        let running = tokio::spawn({
            let n1 = n1.clone();
            async move {
                n1.run_until(async {
                    let _ = rx.await;
                })
                .await
            }
        });

        tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_playlist_registration_creates_broadcaster() {
        let (n1, n2) = nodes();
        n1.spawn();
        let id = StreamId::new("n1strm");

        n1.update_master_playlist(id.as_str(), Bytes::from_static(b"#EXTM3U"))
            .await;
        let broadcaster = n1.registry().broadcaster(&id).await.unwrap();
        assert!(!broadcaster.is_working());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = n2
            .subscribe(&id, move |seq, data, eof| {
                let _ = tx.send((seq, data, eof));
            })
            .await
            .unwrap();

        // The request attaches to the broadcaster rather than a relayer
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while broadcaster.listeners().is_empty().await {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(n1.registry().relayer_count().await, 0);

        n1.broadcast(&id, 7, Bytes::from_static(b"seg")).await.unwrap();
        let (seq, data, eof) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((seq, data.as_ref(), eof), (7, &b"seg"[..], false));

        handle.cancel().await;
    }
}
