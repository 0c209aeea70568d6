//! Stream messaging wire protocol
//!
//! Every frame on a connection has the layout:
//!
//! ```text
//! +----------------------+----------+---------------------------+
//! | body length (varint) | tag (u8) | type-specific payload ... |
//! +----------------------+----------+---------------------------+
//!                        |<-------------- body ---------------->|
//! ```
//!
//! Payload fields use big-endian `u64` for sequence numbers, varint-prefixed
//! UTF-8 for text, varint-prefixed raw bytes for media and manifests, and a
//! varint count followed by key/value text pairs for mappings.

pub mod codec;
pub mod constants;
pub mod id;
pub mod message;

pub use id::{PeerId, StreamId};
pub use message::{Message, MessageTag};
