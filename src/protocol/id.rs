//! Peer and stream identifiers

use std::fmt;

/// Identity of a node in the overlay (hex-encoded public identity)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of one logical media stream
///
/// Stream ids are opaque, but by convention they start with the id of the
/// peer that originates the stream so they never collide across the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a stream id owned by `origin`
    pub fn for_peer(origin: &PeerId, name: &str) -> Self {
        Self(format!("{}{}", origin.as_str(), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id carries `peer` as its origin prefix
    pub fn has_origin(&self, peer: &PeerId) -> bool {
        !peer.as_str().is_empty() && self.0.starts_with(peer.as_str())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_peer_prefix() {
        let origin = PeerId::new("1220abcd");
        let id = StreamId::for_peer(&origin, "strmID");

        assert_eq!(id.as_str(), "1220abcdstrmID");
        assert!(id.has_origin(&origin));
        assert!(!id.has_origin(&PeerId::new("1220ffff")));
    }

    #[test]
    fn test_empty_peer_is_never_origin() {
        let id = StreamId::new("anything");
        assert!(!id.has_origin(&PeerId::new("")));
    }
}
