//! Source resolution for streams this node does not originate

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::protocol::{PeerId, StreamId};

/// Resolves which peer to subscribe to for a stream
pub trait Routing: Send + Sync + 'static {
    /// Peer that can serve `stream_id`, either its origin or a next hop
    fn resolve_source_for(&self, stream_id: &StreamId) -> Option<PeerId>;
}

/// Routing table with three tiers of resolution
///
/// 1. an explicit route registered for the stream id
/// 2. the longest known peer id that prefixes the stream id
/// 3. the fallback peer, if one is set
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: RwLock<HashMap<StreamId, PeerId>>,
    peers: RwLock<Vec<PeerId>>,
    fallback: RwLock<Option<PeerId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directly reachable peer
    pub fn add_peer(&self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        let mut peers = self.peers.write();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.write().retain(|p| p != peer);
    }

    /// Pin a stream to a specific source
    pub fn add_route(&self, stream_id: impl Into<StreamId>, peer: impl Into<PeerId>) {
        self.routes.write().insert(stream_id.into(), peer.into());
    }

    pub fn remove_route(&self, stream_id: &StreamId) -> Option<PeerId> {
        self.routes.write().remove(stream_id)
    }

    /// Peer used when nothing else matches
    pub fn set_fallback(&self, peer: Option<PeerId>) {
        *self.fallback.write() = peer;
    }

    /// Builder form of [`RoutingTable::add_peer`]
    pub fn with_peer(self, peer: impl Into<PeerId>) -> Self {
        self.add_peer(peer);
        self
    }

    /// Builder form of [`RoutingTable::set_fallback`]
    pub fn with_fallback(self, peer: impl Into<PeerId>) -> Self {
        self.set_fallback(Some(peer.into()));
        self
    }
}

impl Routing for RoutingTable {
    fn resolve_source_for(&self, stream_id: &StreamId) -> Option<PeerId> {
        if let Some(peer) = self.routes.read().get(stream_id) {
            return Some(peer.clone());
        }

        let by_origin = self
            .peers
            .read()
            .iter()
            .filter(|peer| stream_id.has_origin(peer))
            .max_by_key(|peer| peer.as_str().len())
            .cloned();

        by_origin.or_else(|| self.fallback.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_prefix() {
        let table = RoutingTable::new().with_peer("aa").with_peer("bb");
        let id = StreamId::for_peer(&PeerId::new("bb"), "strm");

        assert_eq!(table.resolve_source_for(&id), Some(PeerId::new("bb")));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RoutingTable::new().with_peer("12").with_peer("1234");
        let id = StreamId::new("1234video");

        assert_eq!(table.resolve_source_for(&id), Some(PeerId::new("1234")));
    }

    #[test]
    fn test_explicit_route_overrides_prefix() {
        let table = RoutingTable::new().with_peer("aa");
        table.add_route("aastrm", "relay");

        assert_eq!(
            table.resolve_source_for(&StreamId::new("aastrm")),
            Some(PeerId::new("relay"))
        );

        table.remove_route(&StreamId::new("aastrm"));
        assert_eq!(
            table.resolve_source_for(&StreamId::new("aastrm")),
            Some(PeerId::new("aa"))
        );
    }

    #[test]
    fn test_fallback() {
        let table = RoutingTable::new().with_fallback("hop");

        assert_eq!(
            table.resolve_source_for(&StreamId::new("zzstrm")),
            Some(PeerId::new("hop"))
        );

        table.set_fallback(None);
        assert_eq!(table.resolve_source_for(&StreamId::new("zzstrm")), None);
    }

    #[test]
    fn test_remove_peer() {
        let table = RoutingTable::new().with_peer("aa");
        table.add_peer("aa");
        table.remove_peer(&PeerId::new("aa"));

        assert_eq!(table.resolve_source_for(&StreamId::new("aastrm")), None);
    }
}
