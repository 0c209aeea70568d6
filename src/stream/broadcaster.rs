//! Broadcaster for a locally originated stream

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::fanout::ListenerSet;
use crate::error::{Error, Result};
use crate::node::{NodeConfig, StreamRegistry};
use crate::protocol::{Message, PeerId, StreamId};
use crate::stats::FanoutStats;
use crate::transport::FramedStream;

/// Fans locally produced segments out to every registered listener
///
/// The delivery worker is spawned on the first [`broadcast`](Self::broadcast)
/// and drains a bounded queue in order, so frames reach each listener in the
/// order they were enqueued.
pub struct Broadcaster {
    stream_id: StreamId,
    listeners: Arc<ListenerSet>,
    state: Mutex<WorkerState>,
    queue_capacity: usize,
    registry: Weak<StreamRegistry>,
}

#[derive(Default)]
struct WorkerState {
    working: bool,
    closed: bool,
    queue: Option<mpsc::Sender<Message>>,
    worker: Option<JoinHandle<usize>>,
}

impl Broadcaster {
    pub fn new(stream_id: StreamId, config: &NodeConfig, registry: Weak<StreamRegistry>) -> Self {
        Self {
            listeners: Arc::new(ListenerSet::new(stream_id.clone(), config.send_timeout)),
            stream_id,
            state: Mutex::new(WorkerState::default()),
            queue_capacity: config.broadcast_queue_capacity,
            registry,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Whether the delivery worker is running
    pub fn is_working(&self) -> bool {
        self.state.lock().working
    }

    /// Whether [`finish`](Self::finish) has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Listener set this broadcaster delivers to
    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    /// Register a downstream listener
    ///
    /// Fails with [`Error::StreamClosed`] once the finish frame has gone out.
    pub async fn add_listener(&self, peer: PeerId, stream: Arc<FramedStream>) -> Result<()> {
        self.listeners.add(peer, stream).await.map(|_| ())
    }

    pub async fn remove_listener(&self, peer: &PeerId) -> Option<Arc<FramedStream>> {
        self.listeners.remove(peer).await
    }

    /// Queue one segment for delivery
    ///
    /// Returns once the frame is queued, not once it is delivered.
    pub async fn broadcast(&self, seq_no: u64, data: impl Into<Bytes>) -> Result<()> {
        let queue = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::StreamClosed(self.stream_id.clone()));
            }
            self.ensure_worker(&mut state)
        };

        let message = Message::StreamData {
            seq_no,
            stream_id: self.stream_id.clone(),
            data: data.into(),
        };

        queue
            .send(message)
            .await
            .map_err(|_| Error::StreamClosed(self.stream_id.clone()))
    }

    /// Deliver a final `FinishStream` to every listener and shut down
    ///
    /// Frames already queued are delivered first. After this returns the
    /// listener set is empty, the worker has exited and the broadcaster is no
    /// longer registered with its node.
    pub async fn finish(&self) -> Result<()> {
        let (queue, worker) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::StreamClosed(self.stream_id.clone()));
            }
            state.closed = true;
            (state.queue.take(), state.worker.take())
        };

        let finish = Message::FinishStream {
            stream_id: self.stream_id.clone(),
        };

        let mut listeners = 0;
        if let (Some(queue), Some(worker)) = (queue, worker) {
            // The worker closes the listener set when it reaches the finish
            let _ = queue.send(finish.clone()).await;
            drop(queue);

            match worker.await {
                Ok(delivered) => listeners = delivered,
                Err(e) => {
                    tracing::warn!(stream = %self.stream_id, error = %e, "Delivery worker failed");
                }
            }
        }
        // No worker, or one that exited before the finish
        listeners += self.listeners.close(&finish).await;
        self.state.lock().working = false;

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister_broadcaster(&self.stream_id, self).await;
        }

        tracing::info!(
            stream = %self.stream_id,
            listeners = listeners,
            "Broadcaster finished"
        );

        Ok(())
    }

    pub async fn stats(&self) -> FanoutStats {
        self.listeners.stats().await
    }

    fn ensure_worker(&self, state: &mut WorkerState) -> mpsc::Sender<Message> {
        if let Some(queue) = &state.queue {
            return queue.clone();
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let listeners = Arc::clone(&self.listeners);
        let stream_id = self.stream_id.clone();

        state.worker = Some(tokio::spawn(run_delivery(stream_id, listeners, rx)));
        state.queue = Some(tx.clone());
        state.working = true;

        tracing::debug!(stream = %self.stream_id, "Delivery worker started");
        tx
    }
}

async fn run_delivery(
    stream_id: StreamId,
    listeners: Arc<ListenerSet>,
    mut queue: mpsc::Receiver<Message>,
) -> usize {
    while let Some(message) = queue.recv().await {
        if let Message::FinishStream { .. } = message {
            let delivered = listeners.close(&message).await;
            tracing::debug!(stream = %stream_id, delivered, "Delivery worker stopped");
            return delivered;
        }

        let delivered = listeners.deliver(&message).await;
        tracing::trace!(stream = %stream_id, tag = ?message.tag(), delivered, "Frame delivered");
    }

    tracing::debug!(stream = %stream_id, "Delivery worker stopped");
    0
}
