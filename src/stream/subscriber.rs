//! Subscriber for a remotely originated stream
//!
//! A working subscriber runs two tasks. The reader pulls frames off the
//! upstream connection into a bounded delivery queue; the driver drains that
//! queue into the caller's callback. A slow callback therefore never stalls
//! reception until the queue is full, and queue order keeps segments in the
//! order they arrived.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ProtocolError, Result};
use crate::node::{NodeConfig, StreamRegistry};
use crate::protocol::{Message, PeerId, StreamId};
use crate::routing::Routing;
use crate::transport::stream::is_eof;
use crate::transport::{FramedStream, Transport};

/// Boxed segment callback: `(seq_no, data, eof)`
pub type SegmentCallback = Box<dyn FnMut(u64, Bytes, bool) + Send + 'static>;

enum Delivery {
    Segment { seq_no: u64, data: Bytes },
    Finish,
}

/// Consumes one stream from one upstream source
pub struct Subscriber {
    stream_id: StreamId,
    transport: Arc<dyn Transport>,
    routing: Arc<dyn Routing>,
    registry: Weak<StreamRegistry>,
    queue_capacity: usize,
    cancel_timeout: Duration,
    state: Mutex<SubscriberState>,
}

#[derive(Default)]
struct SubscriberState {
    working: bool,
    upstream: Option<Arc<FramedStream>>,
    deliveries: Option<mpsc::Sender<Delivery>>,
    handle: Option<SubscriptionHandle>,
}

impl Subscriber {
    pub fn new(
        stream_id: StreamId,
        transport: Arc<dyn Transport>,
        routing: Arc<dyn Routing>,
        config: &NodeConfig,
        registry: Weak<StreamRegistry>,
    ) -> Self {
        Self {
            stream_id,
            transport,
            routing,
            registry,
            queue_capacity: config.delivery_queue_capacity,
            cancel_timeout: config.cancel_timeout,
            state: Mutex::new(SubscriberState::default()),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn is_working(&self) -> bool {
        self.state.lock().working
    }

    /// Connection to the source, present only while working
    pub fn upstream(&self) -> Option<Arc<FramedStream>> {
        self.state.lock().upstream.clone()
    }

    /// Handle of the active subscription, if any
    pub fn handle(&self) -> Option<SubscriptionHandle> {
        self.state.lock().handle.clone()
    }

    /// Subscribe to the stream's source
    ///
    /// Resolves the source through routing, opens a connection, sends
    /// `SubscribeRequest` and starts the receive worker. `callback` is called
    /// with `(seq_no, data, false)` per segment and once with
    /// `(0, empty, true)` when the source finishes the stream or the
    /// connection drops.
    pub async fn subscribe<F>(self: &Arc<Self>, callback: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(u64, Bytes, bool) + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.working {
                return Err(Error::AlreadySubscribed(self.stream_id.clone()));
            }
            state.working = true;
        }

        match self.connect().await {
            Ok((source, conn)) => {
                tracing::info!(stream = %self.stream_id, source = %source, "Subscribed");
                Ok(self.start_worker(CancellationToken::new(), source, conn, callback))
            }
            Err(e) => {
                self.state.lock().working = false;
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<(PeerId, Arc<FramedStream>)> {
        let source = self
            .routing
            .resolve_source_for(&self.stream_id)
            .ok_or_else(|| ProtocolError::NoSource(self.stream_id.clone()))?;

        let conn = self.transport.open_stream(&source).await?;
        let request = Message::SubscribeRequest {
            stream_id: self.stream_id.clone(),
        };
        if let Err(e) = conn.send(&request).await {
            conn.close().await;
            return Err(e);
        }

        Ok((source, conn))
    }

    /// Run the receive worker over an already established connection
    ///
    /// `subscribe` calls this after sending the request; it is public so a
    /// connection negotiated elsewhere can be handed over directly.
    /// Cancelling `token` (or the returned handle) sends
    /// `CancelSubscription` upstream, closes `conn` and returns the
    /// subscriber to idle.
    pub fn start_worker<F>(
        self: &Arc<Self>,
        token: CancellationToken,
        source: PeerId,
        conn: Arc<FramedStream>,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: FnMut(u64, Bytes, bool) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let handle = SubscriptionHandle {
            stream_id: self.stream_id.clone(),
            token: token.clone(),
            stopped: stopped_rx,
        };

        {
            let mut state = self.state.lock();
            state.working = true;
            state.upstream = Some(Arc::clone(&conn));
            state.deliveries = Some(tx.clone());
            state.handle = Some(handle.clone());
        }

        let worker = Worker {
            subscriber: Arc::clone(self),
            token,
            source,
            conn,
            stopped: stopped_tx,
        };
        tokio::spawn(worker.run(tx, rx, Box::new(callback)));

        handle
    }

    /// Hand a segment received on another connection to the callback
    pub(crate) async fn deliver(&self, seq_no: u64, data: Bytes) -> Result<()> {
        self.push(Delivery::Segment { seq_no, data }).await
    }

    /// Signal end of stream received on another connection
    pub(crate) async fn finish(&self) -> Result<()> {
        self.push(Delivery::Finish).await
    }

    async fn push(&self, delivery: Delivery) -> Result<()> {
        let queue = self.state.lock().deliveries.clone();
        let no_subscriber = || Error::from(ProtocolError::NoSubscriber(self.stream_id.clone()));

        match queue {
            Some(queue) => queue.send(delivery).await.map_err(|_| no_subscriber()),
            None => Err(no_subscriber()),
        }
    }

    /// Cancel the active subscription, if any, and wait for teardown
    pub async fn cancel(&self) {
        let handle = self.state.lock().handle.clone();
        if let Some(handle) = handle {
            handle.cancel().await;
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.working = false;
        state.upstream = None;
        state.deliveries = None;
        state.handle = None;
    }
}

struct Worker {
    subscriber: Arc<Subscriber>,
    token: CancellationToken,
    source: PeerId,
    conn: Arc<FramedStream>,
    stopped: watch::Sender<bool>,
}

impl Worker {
    async fn run(
        self,
        tx: mpsc::Sender<Delivery>,
        mut rx: mpsc::Receiver<Delivery>,
        mut callback: SegmentCallback,
    ) {
        let stream_id = self.subscriber.stream_id.clone();
        let reader = tokio::spawn(read_upstream(
            stream_id.clone(),
            Arc::clone(&self.conn),
            tx,
            self.token.clone(),
        ));

        let cancelled = loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break true,
                delivery = rx.recv() => match delivery {
                    Some(Delivery::Segment { seq_no, data }) => callback(seq_no, data, false),
                    Some(Delivery::Finish) | None => {
                        callback(0, Bytes::new(), true);
                        break false;
                    }
                },
            }
        };

        // Closing the queue unblocks a reader waiting on a full queue
        drop(rx);
        self.token.cancel();
        if let Err(e) = reader.await {
            tracing::warn!(stream = %stream_id, error = %e, "Upstream reader failed");
        }

        self.teardown(cancelled).await;
    }

    async fn teardown(self, cancelled: bool) {
        let subscriber = &self.subscriber;
        let stream_id = &subscriber.stream_id;
        let bound = subscriber.cancel_timeout;

        if cancelled {
            let cancel = Message::CancelSubscription {
                stream_id: stream_id.clone(),
            };
            match tokio::time::timeout(bound, self.conn.send(&cancel)).await {
                Ok(Ok(())) => {
                    tracing::debug!(stream = %stream_id, source = %self.source, "Sent cancel upstream");
                }
                Ok(Err(e)) => {
                    tracing::warn!(stream = %stream_id, source = %self.source, error = %e, "Failed to send cancel upstream");
                }
                Err(_) => {
                    tracing::warn!(stream = %stream_id, source = %self.source, "Cancel upstream timed out");
                }
            }
        }

        if tokio::time::timeout(bound, self.conn.close()).await.is_err() {
            tracing::debug!(stream = %stream_id, "Upstream close timed out");
        }

        if let Some(registry) = subscriber.registry.upgrade() {
            registry.unregister_subscriber(stream_id, subscriber).await;
        }
        subscriber.reset();

        tracing::info!(
            stream = %stream_id,
            source = %self.source,
            cancelled = cancelled,
            "Subscription stopped"
        );

        self.stopped.send_replace(true);
    }
}

async fn read_upstream(
    stream_id: StreamId,
    conn: Arc<FramedStream>,
    deliveries: mpsc::Sender<Delivery>,
    token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            received = conn.receive() => received,
        };

        let delivery = match received {
            Ok(message) if message.stream_id().is_some_and(|id| *id != stream_id) => {
                tracing::debug!(stream = %stream_id, tag = ?message.tag(), "Ignoring frame for another stream");
                continue;
            }
            Ok(Message::StreamData { seq_no, data, .. }) => Delivery::Segment { seq_no, data },
            Ok(Message::FinishStream { .. }) => Delivery::Finish,
            Ok(other) => {
                tracing::debug!(stream = %stream_id, tag = ?other.tag(), "Ignoring message on subscription");
                continue;
            }
            Err(e) => {
                if is_eof(&e) {
                    tracing::debug!(stream = %stream_id, "Upstream closed");
                } else {
                    tracing::warn!(stream = %stream_id, error = %e, "Upstream receive failed");
                }
                Delivery::Finish
            }
        };

        let last = matches!(delivery, Delivery::Finish);
        if deliveries.send(delivery).await.is_err() || last {
            return;
        }
    }
}

/// Handle to a running subscription
///
/// Clones share the same subscription. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    stream_id: StreamId,
    token: CancellationToken,
    stopped: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Cancel the subscription and wait until teardown has finished
    pub async fn cancel(&self) {
        self.token.cancel();
        self.stopped().await;
    }

    /// Whether the worker has fully stopped
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Wait for the worker to stop for any reason
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // Err means the worker is gone without reporting, which is stopped too
        let _ = stopped.wait_for(|done| *done).await;
    }
}
