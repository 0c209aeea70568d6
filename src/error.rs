//! Error types
//!
//! `Decode` and `Connection` errors are fatal for the connection they occur
//! on. `Protocol` errors are reported but leave the connection open.

use std::io;

use thiserror::Error;

use crate::protocol::{PeerId, StreamId};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or unknown message tag
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Underlying transport closed, reset or failed
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Frame received for a stream with no matching local state
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Operation attempted on a finished broadcaster
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    /// Subscriber already has an active upstream subscription
    #[error("already subscribed to stream {0}")]
    AlreadySubscribed(StreamId),

    /// Transport has no route to the peer
    #[error("peer {0} is unreachable")]
    PeerUnreachable(PeerId),

    /// A bounded operation did not complete in time
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    pub(crate) fn closed(reason: &'static str) -> Self {
        Error::Connection(io::Error::new(io::ErrorKind::NotConnected, reason))
    }
}

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame ended before a field was complete
    #[error("unexpected end of frame")]
    UnexpectedEof,

    /// Type discriminator not in the message set
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    /// Text field is not valid UTF-8
    #[error("invalid UTF-8 in text field")]
    InvalidUtf8,

    /// Length prefix does not fit in 64 bits
    #[error("varint overflows 64 bits")]
    VarintOverflow,

    /// Declared frame size exceeds the configured limit
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: u64, max: usize },

    /// Bytes left over after the message payload
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Protocol violations: the frame was well formed but cannot be routed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Stream data or finish arrived for a stream nobody here subscribes to
    #[error("no subscriber for stream {0}")]
    NoSubscriber(StreamId),

    /// Cancel arrived for a stream with no local broadcaster or relayer
    #[error("no broadcaster or relayer for stream {0}")]
    NoPublisher(StreamId),

    /// No source peer can be resolved for the stream
    #[error("no source known for stream {0}")]
    NoSource(StreamId),

    /// Transcode response arrived with no registered handler
    #[error("no transcode response handler for stream {0}")]
    NoHandler(StreamId),

    /// Remote side speaks a different protocol
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
}
