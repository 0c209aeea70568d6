//! Protocol constants

/// Protocol identifier exchanged when a connection is opened
pub const PROTOCOL_ID: &str = "/streamnet/1.0.0";

// Message type discriminators
pub const TAG_STREAM_DATA: u8 = 0x01;
pub const TAG_FINISH_STREAM: u8 = 0x02;
pub const TAG_SUBSCRIBE_REQUEST: u8 = 0x03;
pub const TAG_CANCEL_SUBSCRIPTION: u8 = 0x04;
pub const TAG_TRANSCODE_RESPONSE: u8 = 0x05;
pub const TAG_MASTER_PLAYLIST_UPDATE: u8 = 0x06;
pub const TAG_MASTER_PLAYLIST_REQUEST: u8 = 0x07;

/// Default upper bound on a single frame body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A u64 never needs more than 10 LEB128 bytes
pub const MAX_VARINT_LEN: usize = 10;

/// Upper bound on text exchanged during the connection hello
pub const MAX_HELLO_FIELD_LEN: usize = 1024;

/// Handshaken TCP streams waiting for `accept`
pub const ACCEPT_BACKLOG: usize = 64;
