//! Metadata side channel
//!
//! Transcode reports and master playlists travel over the same protocol as
//! stream data but never touch the broadcaster, subscriber or relayer maps.
//! Playlists are opaque documents here; an empty document means "not found".

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::{PeerId, StreamId};

/// Callback for a transcode report: derived stream id to profile name
pub type TranscodeHandler = Arc<dyn Fn(BTreeMap<String, String>) + Send + Sync>;

#[derive(Default)]
pub struct MetadataRegistry {
    transcode_handlers: Mutex<HashMap<StreamId, TranscodeHandler>>,
    playlists: Mutex<HashMap<String, Bytes>>,
    remote_playlists: Mutex<HashMap<(PeerId, String), Bytes>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the transcode handler for a stream
    pub fn register_transcode_handler<F>(&self, stream_id: StreamId, handler: F)
    where
        F: Fn(BTreeMap<String, String>) + Send + Sync + 'static,
    {
        self.transcode_handlers
            .lock()
            .insert(stream_id, Arc::new(handler));
    }

    pub fn remove_transcode_handler(&self, stream_id: &StreamId) -> bool {
        self.transcode_handlers.lock().remove(stream_id).is_some()
    }

    pub fn transcode_handler(&self, stream_id: &StreamId) -> Option<TranscodeHandler> {
        self.transcode_handlers.lock().get(stream_id).cloned()
    }

    /// Publish a master playlist under `name`
    pub fn update_playlist(&self, name: impl Into<String>, playlist: Bytes) {
        self.playlists.lock().insert(name.into(), playlist);
    }

    pub fn remove_playlist(&self, name: &str) -> Option<Bytes> {
        self.playlists.lock().remove(name)
    }

    /// Locally published playlist
    pub fn playlist(&self, name: &str) -> Option<Bytes> {
        self.playlists.lock().get(name).cloned()
    }

    /// Record a playlist received from `node_id`
    ///
    /// Returns the playlist, or `None` when it was empty. An empty document
    /// evicts any cached copy.
    pub fn store_remote(&self, node_id: PeerId, name: String, playlist: Bytes) -> Option<Bytes> {
        let mut remote = self.remote_playlists.lock();
        if playlist.is_empty() {
            remote.remove(&(node_id, name));
            return None;
        }
        remote.insert((node_id, name), playlist.clone());
        Some(playlist)
    }

    /// Last playlist received from `node_id` under `name`
    pub fn cached_playlist(&self, node_id: &PeerId, name: &str) -> Option<Bytes> {
        self.remote_playlists
            .lock()
            .get(&(node_id.clone(), name.to_string()))
            .cloned()
    }

    /// Playlist to answer a request for `node_id`'s `name` with
    pub(crate) fn lookup(&self, local: &PeerId, node_id: &PeerId, name: &str) -> Option<Bytes> {
        if node_id == local {
            self.playlist(name)
        } else {
            self.cached_playlist(node_id, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_transcode_handler() {
        let metadata = MetadataRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        metadata.register_transcode_handler(StreamId::new("strmid"), move |result| {
            assert_eq!(result.get("strmid1").map(String::as_str), Some("P240p30fps4x3"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handler = metadata.transcode_handler(&StreamId::new("strmid")).unwrap();
        handler(BTreeMap::from([(
            "strmid1".to_string(),
            "P240p30fps4x3".to_string(),
        )]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(metadata.remove_transcode_handler(&StreamId::new("strmid")));
        assert!(metadata.transcode_handler(&StreamId::new("strmid")).is_none());
    }

    #[test]
    fn test_local_and_remote_playlists() {
        let metadata = MetadataRegistry::new();
        let local = PeerId::new("n1");
        let remote = PeerId::new("n2");

        metadata.update_playlist("test", Bytes::from_static(b"#EXTM3U"));
        assert_eq!(
            metadata.lookup(&local, &local, "test"),
            Some(Bytes::from_static(b"#EXTM3U"))
        );
        assert!(metadata.lookup(&local, &remote, "test").is_none());

        let stored = metadata.store_remote(remote.clone(), "test".into(), Bytes::from_static(b"#R"));
        assert_eq!(stored, Some(Bytes::from_static(b"#R")));
        assert_eq!(
            metadata.lookup(&local, &remote, "test"),
            Some(Bytes::from_static(b"#R"))
        );
    }

    #[test]
    fn test_empty_playlist_is_not_found() {
        let metadata = MetadataRegistry::new();
        let remote = PeerId::new("n2");

        metadata.store_remote(remote.clone(), "test".into(), Bytes::from_static(b"#R"));
        assert!(metadata
            .store_remote(remote.clone(), "test".into(), Bytes::new())
            .is_none());
        assert!(metadata.cached_playlist(&remote, "test").is_none());
    }
}
