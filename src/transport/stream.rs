//! Framed message stream over one bidirectional connection

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{DecodeError, Error, Result};
use crate::protocol::constants::MAX_VARINT_LEN;
use crate::protocol::{Message, PeerId};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One connection to a remote peer, carrying length-prefixed messages
///
/// Read and write halves are locked independently: a receive worker can
/// wait for the next frame while another task sends on the same stream.
/// Each `send` writes one whole frame before the next send may begin, and
/// each `receive` reads exactly one frame.
pub struct FramedStream {
    remote: PeerId,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    max_frame_size: usize,
    closed: AtomicBool,
}

impl FramedStream {
    /// Wrap separate read and write halves
    pub fn new<R, W>(remote: PeerId, reader: R, writer: W, max_frame_size: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            remote,
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            max_frame_size,
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap a single duplex IO object
    pub fn from_io<S>(remote: PeerId, io: S, max_frame_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(remote, reader, writer, max_frame_size)
    }

    /// Peer on the other end of this stream
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encode and send one message
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_frame(message.to_frame()).await
    }

    /// Send an already encoded frame (used by fan-out to encode once)
    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("stream closed"));
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wait for the next full frame and decode it
    pub async fn receive(&self) -> Result<Message> {
        let mut reader = self.reader.lock().await;

        let len = read_varint(&mut *reader).await?;
        if len > self.max_frame_size as u64 {
            return Err(DecodeError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            }
            .into());
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;

        Ok(Message::decode(Bytes::from(body))?)
    }

    /// Shut down the write half. The remote sees end-of-stream.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.remote, error = %e, "Stream shutdown failed");
        }
    }
}

impl fmt::Debug for FramedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedStream")
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read an unsigned LEB128 varint from an async reader
pub(crate) async fn read_varint<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(DecodeError::VarintOverflow.into());
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::VarintOverflow.into())
}

/// Read varint-prefixed UTF-8 text of at most `max_len` bytes
pub(crate) async fn read_text<R>(reader: &mut R, max_len: usize) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_varint(reader).await?;
    if len > max_len as u64 {
        return Err(DecodeError::FrameTooLarge {
            size: len,
            max: max_len,
        }
        .into());
    }

    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw).await?;
    String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8.into())
}

/// Map an IO error to the "peer went away" case
pub(crate) fn is_eof(err: &Error) -> bool {
    matches!(err, Error::Connection(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}
