//! Relayer for streams passing through this node

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::fanout::ListenerSet;
use crate::error::Result;
use crate::node::{NodeConfig, StreamRegistry};
use crate::protocol::{Message, PeerId, StreamId};
use crate::stats::FanoutStats;
use crate::transport::stream::is_eof;
use crate::transport::{FramedStream, Transport};

/// Forwards an upstream stream to downstream listeners
///
/// Frames from upstream go straight to the listener set without queueing.
/// An upstream `FinishStream` (or a dropped upstream connection) is passed
/// on to every listener before the relayer tears itself down. When the last
/// listener cancels, the relayer cancels upstream in turn.
pub struct Relayer {
    stream_id: StreamId,
    listeners: ListenerSet,
    upstream: Mutex<Option<Upstream>>,
    finished: AtomicBool,
    cancel_timeout: Duration,
    registry: Weak<StreamRegistry>,
}

struct Upstream {
    peer: PeerId,
    conn: Arc<FramedStream>,
    token: CancellationToken,
}

impl Relayer {
    pub fn new(stream_id: StreamId, config: &NodeConfig, registry: Weak<StreamRegistry>) -> Self {
        Self {
            listeners: ListenerSet::new(stream_id.clone(), config.send_timeout),
            stream_id,
            upstream: Mutex::new(None),
            finished: AtomicBool::new(false),
            cancel_timeout: config.cancel_timeout,
            registry,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    /// Whether the relayer has been torn down
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Peer the relayer receives from, if connected
    pub fn upstream_peer(&self) -> Option<PeerId> {
        self.upstream.lock().as_ref().map(|up| up.peer.clone())
    }

    /// Register a downstream listener
    ///
    /// Fails with [`Error::StreamClosed`](crate::Error::StreamClosed) once
    /// the relayer is tearing down.
    pub async fn add_listener(&self, peer: PeerId, stream: Arc<FramedStream>) -> Result<()> {
        self.listeners.add(peer, stream).await.map(|_| ())
    }

    /// Drop a downstream listener
    ///
    /// Removing the last listener cancels the upstream subscription.
    pub async fn remove_listener(&self, peer: &PeerId) -> Option<Arc<FramedStream>> {
        let removed = self.listeners.remove(peer).await;
        if removed.is_some() && self.listeners.is_empty().await {
            self.cancel_upstream().await;
        }
        removed
    }

    /// Open a connection to `source` and subscribe to the stream
    pub async fn subscribe_upstream(
        self: &Arc<Self>,
        transport: &dyn Transport,
        source: &PeerId,
    ) -> Result<()> {
        let conn = transport.open_stream(source).await?;
        let request = Message::SubscribeRequest {
            stream_id: self.stream_id.clone(),
        };
        if let Err(e) = conn.send(&request).await {
            conn.close().await;
            return Err(e);
        }

        self.attach_upstream(source.clone(), conn);
        Ok(())
    }

    /// Start forwarding frames received on `conn`
    pub fn attach_upstream(self: &Arc<Self>, peer: PeerId, conn: Arc<FramedStream>) {
        let token = CancellationToken::new();
        let previous = self.upstream.lock().replace(Upstream {
            peer: peer.clone(),
            conn: Arc::clone(&conn),
            token: token.clone(),
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        tracing::info!(stream = %self.stream_id, source = %peer, "Relaying stream");
        tokio::spawn(Arc::clone(self).forward(conn, token));
    }

    async fn forward(self: Arc<Self>, conn: Arc<FramedStream>, token: CancellationToken) {
        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                received = conn.receive() => received,
            };

            match received {
                Ok(message @ Message::StreamData { .. }) => self.relay(&message).await,
                Ok(Message::FinishStream { .. }) => {
                    self.finish().await;
                    return;
                }
                Ok(other) => {
                    tracing::debug!(stream = %self.stream_id, tag = ?other.tag(), "Ignoring message from upstream");
                }
                Err(e) => {
                    if is_eof(&e) {
                        tracing::debug!(stream = %self.stream_id, "Upstream closed");
                    } else {
                        tracing::warn!(stream = %self.stream_id, error = %e, "Upstream receive failed");
                    }
                    self.finish().await;
                    return;
                }
            }
        }
    }

    /// Forward one frame to every listener
    pub async fn relay(&self, message: &Message) {
        self.listeners.deliver(message).await;

        if self.listeners.is_empty().await {
            tracing::debug!(stream = %self.stream_id, "No listeners left");
            self.cancel_upstream().await;
        }
    }

    /// Pass `FinishStream` downstream and tear down
    pub async fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let delivered = self.listeners.close(&self.finish_message()).await;
        self.release_upstream(None).await;
        self.unregister().await;

        tracing::info!(stream = %self.stream_id, listeners = delivered, "Relayer finished");
    }

    /// Send `CancelSubscription` upstream and tear down
    pub async fn cancel_upstream(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        // Anyone who joined since the set emptied still hears the end
        self.listeners.close(&self.finish_message()).await;

        let cancel = Message::CancelSubscription {
            stream_id: self.stream_id.clone(),
        };
        self.release_upstream(Some(&cancel)).await;
        self.unregister().await;

        tracing::info!(stream = %self.stream_id, "Relayer cancelled upstream");
    }

    pub async fn stats(&self) -> FanoutStats {
        self.listeners.stats().await
    }

    fn finish_message(&self) -> Message {
        Message::FinishStream {
            stream_id: self.stream_id.clone(),
        }
    }

    async fn release_upstream(&self, farewell: Option<&Message>) {
        let upstream = self.upstream.lock().take();
        let Some(upstream) = upstream else {
            return;
        };

        upstream.token.cancel();

        if let Some(message) = farewell {
            match tokio::time::timeout(self.cancel_timeout, upstream.conn.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(stream = %self.stream_id, source = %upstream.peer, error = %e, "Failed to send cancel upstream");
                }
                Err(_) => {
                    tracing::warn!(stream = %self.stream_id, source = %upstream.peer, "Cancel upstream timed out");
                }
            }
        }

        if tokio::time::timeout(self.cancel_timeout, upstream.conn.close())
            .await
            .is_err()
        {
            tracing::debug!(stream = %self.stream_id, "Upstream close timed out");
        }
    }

    async fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister_relayer(&self.stream_id, self).await;
        }
    }
}
