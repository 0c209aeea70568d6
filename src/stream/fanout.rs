//! Listener fan-out shared by broadcasters and relayers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::protocol::{Message, PeerId, StreamId};
use crate::stats::FanoutStats;
use crate::transport::FramedStream;

/// Set of downstream listeners for one stream
///
/// Delivery sends a frame to every listener in turn. A listener whose send
/// fails or exceeds `send_timeout` is closed and removed; the remaining
/// listeners still receive the frame. Once [`close`](Self::close) has run
/// the set refuses new listeners.
pub struct ListenerSet {
    stream_id: StreamId,
    inner: RwLock<Listeners>,
    send_timeout: Duration,
    frames_delivered: AtomicU64,
    listeners_dropped: AtomicU64,
}

#[derive(Default)]
struct Listeners {
    streams: HashMap<PeerId, Arc<FramedStream>>,
    closed: bool,
}

type Target = (PeerId, Arc<FramedStream>);

impl ListenerSet {
    pub fn new(stream_id: StreamId, send_timeout: Duration) -> Self {
        Self {
            stream_id,
            inner: RwLock::new(Listeners::default()),
            send_timeout,
            frames_delivered: AtomicU64::new(0),
            listeners_dropped: AtomicU64::new(0),
        }
    }

    /// Register (or replace) the listener for `peer`
    ///
    /// Fails with [`Error::StreamClosed`] once the set has been closed.
    pub async fn add(
        &self,
        peer: PeerId,
        stream: Arc<FramedStream>,
    ) -> Result<Option<Arc<FramedStream>>> {
        let previous = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(Error::StreamClosed(self.stream_id.clone()));
            }
            inner.streams.insert(peer.clone(), stream)
        };

        tracing::debug!(
            stream = %self.stream_id,
            peer = %peer,
            replaced = previous.is_some(),
            "Listener added"
        );

        Ok(previous)
    }

    pub async fn remove(&self, peer: &PeerId) -> Option<Arc<FramedStream>> {
        let removed = self.inner.write().await.streams.remove(peer);
        if removed.is_some() {
            tracing::debug!(stream = %self.stream_id, peer = %peer, "Listener removed");
        }
        removed
    }

    pub async fn get(&self, peer: &PeerId) -> Option<Arc<FramedStream>> {
        self.inner.read().await.streams.get(peer).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.streams.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.streams.is_empty()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.read().await.streams.keys().cloned().collect()
    }

    /// Send `message` to every current listener
    ///
    /// Returns the number of listeners that received it.
    pub async fn deliver(&self, message: &Message) -> usize {
        // Snapshot so no lock is held while sending
        let targets: Vec<Target> = self
            .inner
            .read()
            .await
            .streams
            .iter()
            .map(|(peer, stream)| (peer.clone(), Arc::clone(stream)))
            .collect();

        let (delivered, failed) = self.send_all(message.to_frame(), targets).await;

        if !failed.is_empty() {
            let mut inner = self.inner.write().await;
            for (peer, stream) in &failed {
                // Only drop the exact stream that failed; it may have been replaced
                if inner
                    .streams
                    .get(peer)
                    .is_some_and(|current| Arc::ptr_eq(current, stream))
                {
                    inner.streams.remove(peer);
                    self.listeners_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.close_failed(failed).await;

        delivered
    }

    /// Close the set and send `last` to every listener it held
    ///
    /// Marking the set closed and taking its listeners happen under one
    /// lock, so a listener is either refused or receives `last`. Returns
    /// the number of listeners that received it; a second call returns 0.
    pub async fn close(&self, last: &Message) -> usize {
        let targets: Vec<Target> = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            inner.streams.drain().collect()
        };

        let (delivered, failed) = self.send_all(last.to_frame(), targets).await;
        self.listeners_dropped
            .fetch_add(failed.len() as u64, Ordering::Relaxed);
        self.close_failed(failed).await;

        delivered
    }

    pub async fn stats(&self) -> FanoutStats {
        FanoutStats {
            listeners: self.len().await,
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            listeners_dropped: self.listeners_dropped.load(Ordering::Relaxed),
        }
    }

    async fn send_all(&self, frame: Bytes, targets: Vec<Target>) -> (usize, Vec<Target>) {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (peer, stream) in targets {
            match tokio::time::timeout(self.send_timeout, stream.send_frame(frame.clone())).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        stream = %self.stream_id,
                        peer = %peer,
                        error = %e,
                        "Send to listener failed, removing"
                    );
                    failed.push((peer, stream));
                }
                Err(_) => {
                    tracing::warn!(
                        stream = %self.stream_id,
                        peer = %peer,
                        timeout_ms = self.send_timeout.as_millis() as u64,
                        "Send to listener timed out, removing"
                    );
                    failed.push((peer, stream));
                }
            }
        }

        self.frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        (delivered, failed)
    }

    // A timed out send may have left a partial frame behind
    async fn close_failed(&self, failed: Vec<Target>) {
        for (peer, stream) in failed {
            if tokio::time::timeout(self.send_timeout, stream.close())
                .await
                .is_err()
            {
                tracing::debug!(stream = %self.stream_id, peer = %peer, "Listener close timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe(remote: &str) -> (Arc<FramedStream>, FramedStream) {
        let (near, far) = tokio::io::duplex(4096);
        (
            Arc::new(FramedStream::from_io(PeerId::new(remote), near, 1 << 20)),
            FramedStream::from_io(PeerId::new("local"), far, 1 << 20),
        )
    }

    fn data(seq_no: u64) -> Message {
        Message::StreamData {
            seq_no,
            stream_id: StreamId::new("strm"),
            data: Bytes::from_static(b"x"),
        }
    }

    #[tokio::test]
    async fn test_deliver_to_all() {
        let set = ListenerSet::new(StreamId::new("strm"), Duration::from_secs(1));
        let (l1, r1) = pipe("l1");
        let (l2, r2) = pipe("l2");
        set.add(PeerId::new("l1"), l1).await.unwrap();
        set.add(PeerId::new("l2"), l2).await.unwrap();

        assert_eq!(set.deliver(&data(0)).await, 2);
        assert_eq!(r1.receive().await.unwrap(), data(0));
        assert_eq!(r2.receive().await.unwrap(), data(0));
    }

    #[tokio::test]
    async fn test_failed_listener_removed_others_served() {
        let set = ListenerSet::new(StreamId::new("strm"), Duration::from_secs(1));
        let (dead, _) = pipe("dead");
        dead.close().await;
        let (live, remote) = pipe("live");
        set.add(PeerId::new("dead"), dead).await.unwrap();
        set.add(PeerId::new("live"), live).await.unwrap();

        assert_eq!(set.deliver(&data(1)).await, 1);
        assert_eq!(remote.receive().await.unwrap(), data(1));
        assert_eq!(set.peers().await, vec![PeerId::new("live")]);

        let stats = set.stats().await;
        assert_eq!(stats.listeners, 1);
        assert_eq!(stats.frames_delivered, 1);
        assert_eq!(stats.listeners_dropped, 1);
    }

    #[tokio::test]
    async fn test_slow_listener_times_out_and_is_closed() {
        let set = ListenerSet::new(StreamId::new("strm"), Duration::from_millis(50));
        // A 16 byte pipe nobody reads fills up on the first frame
        let (near, far) = tokio::io::duplex(16);
        let stalled = Arc::new(FramedStream::from_io(PeerId::new("slow"), near, 1 << 20));
        set.add(PeerId::new("slow"), stalled).await.unwrap();

        let big = Message::StreamData {
            seq_no: 0,
            stream_id: StreamId::new("strm"),
            data: Bytes::from(vec![0u8; 1024]),
        };
        assert_eq!(set.deliver(&big).await, 0);
        assert!(set.is_empty().await);

        // The remote end gets EOF after the torn frame instead of hanging
        let remote = FramedStream::from_io(PeerId::new("local"), far, 1 << 20);
        let received = tokio::time::timeout(Duration::from_secs(1), remote.receive()).await;
        assert!(matches!(received, Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let set = ListenerSet::new(StreamId::new("strm"), Duration::from_secs(1));
        let (first, _r1) = pipe("p");
        let (second, _r2) = pipe("p");

        assert!(set
            .add(PeerId::new("p"), Arc::clone(&first))
            .await
            .unwrap()
            .is_none());
        let replaced = set
            .add(PeerId::new("p"), Arc::clone(&second))
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&set.get(&PeerId::new("p")).await.unwrap(), &second));

        assert!(set.remove(&PeerId::new("p")).await.is_some());
        assert_eq!(set.len().await, 0);
    }

    #[tokio::test]
    async fn test_close_sends_last_frame_and_refuses_new_listeners() {
        let set = ListenerSet::new(StreamId::new("strm"), Duration::from_secs(1));
        let (l1, r1) = pipe("l1");
        set.add(PeerId::new("l1"), l1).await.unwrap();

        let finish = Message::FinishStream {
            stream_id: StreamId::new("strm"),
        };
        assert_eq!(set.close(&finish).await, 1);
        assert_eq!(r1.receive().await.unwrap(), finish);
        assert!(set.is_closed().await);
        assert!(set.is_empty().await);

        let (late, _r2) = pipe("late");
        let err = set.add(PeerId::new("late"), late).await.unwrap_err();
        assert!(matches!(err, Error::StreamClosed(_)));

        // Closing again sends nothing
        assert_eq!(set.close(&finish).await, 0);
    }

    #[tokio::test]
    async fn test_listener_added_while_closing_is_refused() {
        let set = Arc::new(ListenerSet::new(StreamId::new("strm"), Duration::from_millis(500)));
        // One byte pipe: the finish frame stalls until the send times out
        let (near, _far) = tokio::io::duplex(1);
        let stalled = Arc::new(FramedStream::from_io(PeerId::new("slow"), near, 1 << 20));
        set.add(PeerId::new("slow"), stalled).await.unwrap();

        let closing = tokio::spawn({
            let set = Arc::clone(&set);
            async move {
                set.close(&Message::FinishStream {
                    stream_id: StreamId::new("strm"),
                })
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (late, _r) = pipe("late");
        assert!(set.add(PeerId::new("late"), late).await.is_err());
        assert_eq!(closing.await.unwrap(), 0);
        assert_eq!(set.stats().await.listeners_dropped, 1);
    }
}
