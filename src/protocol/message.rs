//! Message set and frame encoding

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{
    get_bytes, get_string, get_u64, get_varint, put_bytes, put_str, put_u64, put_varint,
    varint_len,
};
use super::constants::*;
use super::id::{PeerId, StreamId};
use crate::error::DecodeError;

/// Message type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    StreamData = TAG_STREAM_DATA,
    FinishStream = TAG_FINISH_STREAM,
    SubscribeRequest = TAG_SUBSCRIBE_REQUEST,
    CancelSubscription = TAG_CANCEL_SUBSCRIPTION,
    TranscodeResponse = TAG_TRANSCODE_RESPONSE,
    MasterPlaylistUpdate = TAG_MASTER_PLAYLIST_UPDATE,
    MasterPlaylistRequest = TAG_MASTER_PLAYLIST_REQUEST,
}

impl TryFrom<u8> for MessageTag {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            TAG_STREAM_DATA => Ok(MessageTag::StreamData),
            TAG_FINISH_STREAM => Ok(MessageTag::FinishStream),
            TAG_SUBSCRIBE_REQUEST => Ok(MessageTag::SubscribeRequest),
            TAG_CANCEL_SUBSCRIPTION => Ok(MessageTag::CancelSubscription),
            TAG_TRANSCODE_RESPONSE => Ok(MessageTag::TranscodeResponse),
            TAG_MASTER_PLAYLIST_UPDATE => Ok(MessageTag::MasterPlaylistUpdate),
            TAG_MASTER_PLAYLIST_REQUEST => Ok(MessageTag::MasterPlaylistRequest),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// One segment chunk, in sequence order
    StreamData {
        seq_no: u64,
        stream_id: StreamId,
        data: Bytes,
    },

    /// No further `StreamData` follows for this stream
    FinishStream { stream_id: StreamId },

    /// Begin receiving a stream
    SubscribeRequest { stream_id: StreamId },

    /// Stop receiving a stream
    CancelSubscription { stream_id: StreamId },

    /// Derived-stream report keyed by derived stream id
    TranscodeResponse {
        stream_id: StreamId,
        result: BTreeMap<String, String>,
    },

    /// Manifest push, also the reply to a request. An empty playlist means
    /// the node does not know the name.
    MasterPlaylistUpdate {
        node_id: PeerId,
        name: String,
        playlist: Bytes,
    },

    /// Ask `node_id` for its manifest called `name`
    MasterPlaylistRequest { node_id: PeerId, name: String },
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::StreamData { .. } => MessageTag::StreamData,
            Message::FinishStream { .. } => MessageTag::FinishStream,
            Message::SubscribeRequest { .. } => MessageTag::SubscribeRequest,
            Message::CancelSubscription { .. } => MessageTag::CancelSubscription,
            Message::TranscodeResponse { .. } => MessageTag::TranscodeResponse,
            Message::MasterPlaylistUpdate { .. } => MessageTag::MasterPlaylistUpdate,
            Message::MasterPlaylistRequest { .. } => MessageTag::MasterPlaylistRequest,
        }
    }

    /// Stream the message belongs to, if it is a data-plane message
    pub fn stream_id(&self) -> Option<&StreamId> {
        match self {
            Message::StreamData { stream_id, .. }
            | Message::FinishStream { stream_id }
            | Message::SubscribeRequest { stream_id }
            | Message::CancelSubscription { stream_id }
            | Message::TranscodeResponse { stream_id, .. } => Some(stream_id),
            Message::MasterPlaylistUpdate { .. } | Message::MasterPlaylistRequest { .. } => None,
        }
    }

    /// Encode tag and payload (the frame body) into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);

        match self {
            Message::StreamData {
                seq_no,
                stream_id,
                data,
            } => {
                put_u64(buf, *seq_no);
                put_str(buf, stream_id.as_str());
                put_bytes(buf, data);
            }
            Message::FinishStream { stream_id }
            | Message::SubscribeRequest { stream_id }
            | Message::CancelSubscription { stream_id } => {
                put_str(buf, stream_id.as_str());
            }
            Message::TranscodeResponse { stream_id, result } => {
                put_str(buf, stream_id.as_str());
                put_varint(buf, result.len() as u64);
                for (key, value) in result {
                    put_str(buf, key);
                    put_str(buf, value);
                }
            }
            Message::MasterPlaylistUpdate {
                node_id,
                name,
                playlist,
            } => {
                put_str(buf, node_id.as_str());
                put_str(buf, name);
                put_bytes(buf, playlist);
            }
            Message::MasterPlaylistRequest { node_id, name } => {
                put_str(buf, node_id.as_str());
                put_str(buf, name);
            }
        }
    }

    /// Encode a complete frame: length prefix followed by the body
    pub fn to_frame(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.encode(&mut body);

        let mut frame = BytesMut::with_capacity(varint_len(body.len() as u64) + body.len());
        put_varint(&mut frame, body.len() as u64);
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Decode a frame body. The whole buffer must be consumed.
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::UnexpectedEof);
        }

        let tag = MessageTag::try_from(buf.get_u8())?;
        let message = match tag {
            MessageTag::StreamData => {
                let seq_no = get_u64(&mut buf)?;
                let stream_id = StreamId::new(get_string(&mut buf)?);
                let data = get_bytes(&mut buf)?;
                Message::StreamData {
                    seq_no,
                    stream_id,
                    data,
                }
            }
            MessageTag::FinishStream => Message::FinishStream {
                stream_id: StreamId::new(get_string(&mut buf)?),
            },
            MessageTag::SubscribeRequest => Message::SubscribeRequest {
                stream_id: StreamId::new(get_string(&mut buf)?),
            },
            MessageTag::CancelSubscription => Message::CancelSubscription {
                stream_id: StreamId::new(get_string(&mut buf)?),
            },
            MessageTag::TranscodeResponse => {
                let stream_id = StreamId::new(get_string(&mut buf)?);
                let count = get_varint(&mut buf)?;
                // Each pair takes at least two length bytes
                if count > (buf.remaining() / 2) as u64 {
                    return Err(DecodeError::UnexpectedEof);
                }
                let mut result = BTreeMap::new();
                for _ in 0..count {
                    let key = get_string(&mut buf)?;
                    let value = get_string(&mut buf)?;
                    result.insert(key, value);
                }
                Message::TranscodeResponse { stream_id, result }
            }
            MessageTag::MasterPlaylistUpdate => Message::MasterPlaylistUpdate {
                node_id: PeerId::new(get_string(&mut buf)?),
                name: get_string(&mut buf)?,
                playlist: get_bytes(&mut buf)?,
            },
            MessageTag::MasterPlaylistRequest => Message::MasterPlaylistRequest {
                node_id: PeerId::new(get_string(&mut buf)?),
                name: get_string(&mut buf)?,
            },
        };

        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }

        Ok(message)
    }
}
