//! Per-node stream registry
//!
//! Owns the three maps from stream id to broadcaster, subscriber and
//! relayer. Each map has its own lock; no lock is held while a stream
//! instance sends or receives.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;

use super::config::NodeConfig;
use super::metadata::MetadataRegistry;
use crate::protocol::{PeerId, StreamId};
use crate::routing::Routing;
use crate::stats::NodeStats;
use crate::stream::{Broadcaster, Relayer, Subscriber};
use crate::transport::Transport;

type InstanceMap<T> = RwLock<HashMap<StreamId, Arc<T>>>;

/// Registry of the stream instances on one node
pub struct StreamRegistry {
    transport: Arc<dyn Transport>,
    routing: Arc<dyn Routing>,
    config: NodeConfig,
    metadata: MetadataRegistry,

    broadcasters: InstanceMap<Broadcaster>,
    subscribers: InstanceMap<Subscriber>,
    relayers: InstanceMap<Relayer>,

    /// Handed to instances so they can unregister themselves
    this: Weak<StreamRegistry>,
}

impl StreamRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        routing: Arc<dyn Routing>,
        config: NodeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            routing,
            config,
            metadata: MetadataRegistry::new(),
            broadcasters: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            relayers: RwLock::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn local_peer(&self) -> &PeerId {
        self.transport.local_peer_id()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn routing(&self) -> &Arc<dyn Routing> {
        &self.routing
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Transcode handlers and master playlists
    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }

    /// Get the broadcaster for `id`, creating it if absent
    ///
    /// A broadcaster that has already finished is replaced.
    pub async fn get_broadcaster(&self, id: &StreamId) -> Arc<Broadcaster> {
        if let Some(existing) = self.broadcasters.read().await.get(id) {
            if !existing.is_closed() {
                return Arc::clone(existing);
            }
        }

        let mut broadcasters = self.broadcasters.write().await;
        if let Some(existing) = broadcasters.get(id) {
            if !existing.is_closed() {
                return Arc::clone(existing);
            }
        }

        let broadcaster = Arc::new(Broadcaster::new(id.clone(), &self.config, self.this.clone()));
        broadcasters.insert(id.clone(), Arc::clone(&broadcaster));

        tracing::info!(stream = %id, "Broadcaster created");
        broadcaster
    }

    /// Get the subscriber for `id`, creating it if absent
    pub async fn get_subscriber(&self, id: &StreamId) -> Arc<Subscriber> {
        if let Some(existing) = self.subscribers.read().await.get(id) {
            return Arc::clone(existing);
        }

        let mut subscribers = self.subscribers.write().await;
        let subscriber = subscribers.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(stream = %id, "Subscriber created");
            Arc::new(Subscriber::new(
                id.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.routing),
                &self.config,
                self.this.clone(),
            ))
        });
        Arc::clone(subscriber)
    }

    /// Get the relayer for `id`, creating it if absent
    ///
    /// The flag is `true` when the relayer was created by this call; the
    /// caller is then responsible for subscribing it upstream.
    pub async fn get_or_create_relayer(&self, id: &StreamId) -> (Arc<Relayer>, bool) {
        if let Some(existing) = self.relayers.read().await.get(id) {
            if !existing.is_finished() {
                return (Arc::clone(existing), false);
            }
        }

        let mut relayers = self.relayers.write().await;
        if let Some(existing) = relayers.get(id) {
            if !existing.is_finished() {
                return (Arc::clone(existing), false);
            }
        }

        let relayer = Arc::new(Relayer::new(id.clone(), &self.config, self.this.clone()));
        relayers.insert(id.clone(), Arc::clone(&relayer));

        tracing::info!(stream = %id, "Relayer created");
        (relayer, true)
    }

    /// Create and register a relayer, replacing any existing one
    pub async fn new_relayer(&self, id: &StreamId) -> Arc<Relayer> {
        let relayer = Arc::new(Relayer::new(id.clone(), &self.config, self.this.clone()));
        self.relayers
            .write()
            .await
            .insert(id.clone(), Arc::clone(&relayer));
        relayer
    }

    pub async fn broadcaster(&self, id: &StreamId) -> Option<Arc<Broadcaster>> {
        self.broadcasters.read().await.get(id).cloned()
    }

    pub async fn subscriber(&self, id: &StreamId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().await.get(id).cloned()
    }

    pub async fn relayer(&self, id: &StreamId) -> Option<Arc<Relayer>> {
        self.relayers.read().await.get(id).cloned()
    }

    pub async fn delete_broadcaster(&self, id: &StreamId) -> Option<Arc<Broadcaster>> {
        self.broadcasters.write().await.remove(id)
    }

    pub async fn delete_subscriber(&self, id: &StreamId) -> Option<Arc<Subscriber>> {
        self.subscribers.write().await.remove(id)
    }

    pub async fn delete_relayer(&self, id: &StreamId) -> Option<Arc<Relayer>> {
        self.relayers.write().await.remove(id)
    }

    pub(crate) async fn unregister_broadcaster(&self, id: &StreamId, instance: &Broadcaster) {
        remove_same(&self.broadcasters, id, instance).await;
    }

    pub(crate) async fn unregister_subscriber(&self, id: &StreamId, instance: &Subscriber) {
        remove_same(&self.subscribers, id, instance).await;
    }

    pub(crate) async fn unregister_relayer(&self, id: &StreamId, instance: &Relayer) {
        remove_same(&self.relayers, id, instance).await;
    }

    pub async fn broadcaster_count(&self) -> usize {
        self.broadcasters.read().await.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn relayer_count(&self) -> usize {
        self.relayers.read().await.len()
    }

    /// Snapshot of instance counts and fan-out counters
    pub async fn stats(&self) -> NodeStats {
        let broadcasters: Vec<_> = self.broadcasters.read().await.values().cloned().collect();
        let relayers: Vec<_> = self.relayers.read().await.values().cloned().collect();

        let mut stats = NodeStats {
            broadcasters: broadcasters.len(),
            subscribers: self.subscriber_count().await,
            relayers: relayers.len(),
            ..Default::default()
        };

        for broadcaster in &broadcasters {
            stats.add_fanout(&broadcaster.stats().await);
        }
        for relayer in &relayers {
            stats.add_fanout(&relayer.stats().await);
        }

        stats
    }
}

/// Remove `id` only if it still maps to `instance`
async fn remove_same<T>(map: &InstanceMap<T>, id: &StreamId, instance: &T) -> bool {
    let mut map = map.write().await;
    let same = map
        .get(id)
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), instance));

    if same {
        map.remove(id);
    }
    same
}
