//! Inbound frame dispatch
//!
//! One [`serve_stream`] loop runs per accepted stream. Each frame is routed
//! to the broadcaster, subscriber or relayer registered for its stream id,
//! or to the metadata side channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use super::registry::StreamRegistry;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Message, PeerId, StreamId};
use crate::transport::stream::is_eof;
use crate::transport::FramedStream;

/// Receive and dispatch frames until the stream ends
///
/// Decode errors close the stream. Protocol errors are logged and the
/// stream stays open.
pub async fn serve_stream(registry: Arc<StreamRegistry>, stream: Arc<FramedStream>) {
    let peer = stream.remote_peer().clone();
    tracing::debug!(peer = %peer, "Serving inbound stream");

    loop {
        let message = match stream.receive().await {
            Ok(message) => message,
            Err(e @ Error::Decode(_)) => {
                tracing::warn!(peer = %peer, error = %e, "Malformed frame, closing stream");
                stream.close().await;
                break;
            }
            Err(e) => {
                if is_eof(&e) {
                    tracing::debug!(peer = %peer, "Inbound stream closed");
                } else {
                    tracing::debug!(peer = %peer, error = %e, "Inbound stream failed");
                }
                break;
            }
        };

        let tag = message.tag();
        if let Err(e) = handle_message(&registry, &stream, message).await {
            tracing::warn!(peer = %peer, tag = ?tag, error = %e, "Failed to handle message");
        }
    }
}

/// Route one inbound message received on `stream`
pub async fn handle_message(
    registry: &Arc<StreamRegistry>,
    stream: &Arc<FramedStream>,
    message: Message,
) -> Result<()> {
    match message {
        Message::SubscribeRequest { stream_id } => {
            handle_subscribe_request(registry, stream, &stream_id).await
        }
        Message::StreamData {
            seq_no,
            stream_id,
            data,
        } => handle_stream_data(registry, &stream_id, seq_no, data).await,
        Message::CancelSubscription { stream_id } => {
            handle_cancel_subscription(registry, stream.remote_peer(), &stream_id).await
        }
        Message::FinishStream { stream_id } => handle_finish_stream(registry, &stream_id).await,
        Message::TranscodeResponse { stream_id, result } => {
            handle_transcode_response(registry, &stream_id, result)
        }
        Message::MasterPlaylistRequest { node_id, name } => {
            handle_playlist_request(registry, stream, node_id, name).await
        }
        Message::MasterPlaylistUpdate {
            node_id,
            name,
            playlist,
        } => {
            registry.metadata().store_remote(node_id, name, playlist);
            Ok(())
        }
    }
}

/// Register the requesting stream as a listener
///
/// Prefers a local broadcaster, then an existing relayer. Otherwise a new
/// relayer is created and subscribed to the source routing resolves.
pub(crate) async fn handle_subscribe_request(
    registry: &Arc<StreamRegistry>,
    stream: &Arc<FramedStream>,
    stream_id: &StreamId,
) -> Result<()> {
    let requester = stream.remote_peer().clone();

    if let Some(broadcaster) = registry.broadcaster(stream_id).await {
        if broadcaster
            .add_listener(requester.clone(), Arc::clone(stream))
            .await
            .is_err()
        {
            return refuse_finishing(stream, stream_id).await;
        }
        return Ok(());
    }

    let (relayer, created) = registry.get_or_create_relayer(stream_id).await;
    if relayer
        .add_listener(requester.clone(), Arc::clone(stream))
        .await
        .is_err()
    {
        return refuse_finishing(stream, stream_id).await;
    }
    if !created {
        return Ok(());
    }

    // Never route back to ourselves or to whoever asked
    let source = registry
        .routing()
        .resolve_source_for(stream_id)
        .filter(|source| source != registry.local_peer() && *source != requester);

    let result = match source {
        Some(source) => {
            relayer
                .subscribe_upstream(registry.transport().as_ref(), &source)
                .await
        }
        None => Err(ProtocolError::NoSource(stream_id.clone()).into()),
    };

    if result.is_err() {
        // Listeners see the stream end rather than waiting forever
        relayer.finish().await;
    }
    result
}

/// The stream is ending; tell the requester directly
async fn refuse_finishing(stream: &FramedStream, stream_id: &StreamId) -> Result<()> {
    tracing::debug!(
        stream = %stream_id,
        peer = %stream.remote_peer(),
        "Subscribe request while stream is finishing"
    );
    stream
        .send(&Message::FinishStream {
            stream_id: stream_id.clone(),
        })
        .await
}

pub(crate) async fn handle_stream_data(
    registry: &StreamRegistry,
    stream_id: &StreamId,
    seq_no: u64,
    data: Bytes,
) -> Result<()> {
    let subscriber = registry
        .subscriber(stream_id)
        .await
        .ok_or_else(|| ProtocolError::NoSubscriber(stream_id.clone()))?;

    subscriber.deliver(seq_no, data).await
}

pub(crate) async fn handle_cancel_subscription(
    registry: &StreamRegistry,
    peer: &PeerId,
    stream_id: &StreamId,
) -> Result<()> {
    if let Some(broadcaster) = registry.broadcaster(stream_id).await {
        broadcaster.remove_listener(peer).await;
        return Ok(());
    }

    if let Some(relayer) = registry.relayer(stream_id).await {
        relayer.remove_listener(peer).await;
        return Ok(());
    }

    Err(ProtocolError::NoPublisher(stream_id.clone()).into())
}

pub(crate) async fn handle_finish_stream(
    registry: &StreamRegistry,
    stream_id: &StreamId,
) -> Result<()> {
    if let Some(subscriber) = registry.subscriber(stream_id).await {
        return subscriber.finish().await;
    }

    if let Some(relayer) = registry.relayer(stream_id).await {
        relayer.finish().await;
        return Ok(());
    }

    Err(ProtocolError::NoSubscriber(stream_id.clone()).into())
}

pub(crate) fn handle_transcode_response(
    registry: &StreamRegistry,
    stream_id: &StreamId,
    result: BTreeMap<String, String>,
) -> Result<()> {
    let handler = registry
        .metadata()
        .transcode_handler(stream_id)
        .ok_or_else(|| ProtocolError::NoHandler(stream_id.clone()))?;

    handler(result);
    Ok(())
}

/// Answer on the same stream; unknown playlists are sent back empty
pub(crate) async fn handle_playlist_request(
    registry: &StreamRegistry,
    stream: &FramedStream,
    node_id: PeerId,
    name: String,
) -> Result<()> {
    let playlist = registry
        .metadata()
        .lookup(registry.local_peer(), &node_id, &name)
        .unwrap_or_default();

    stream
        .send(&Message::MasterPlaylistUpdate {
            node_id,
            name,
            playlist,
        })
        .await
}
