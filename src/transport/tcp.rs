//! TCP transport
//!
//! Every connection starts with a hello from the opening side:
//!
//! ```text
//! [varint len][protocol id][varint len][opener peer id]
//! ```
//!
//! after which both directions carry ordinary frames. Inbound hellos are
//! read on a task per connection, so a silent client never holds up the
//! accept loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::config::TransportConfig;
use super::stream::{read_text, FramedStream};
use super::Transport;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::codec::put_str;
use crate::protocol::constants::{ACCEPT_BACKLOG, MAX_HELLO_FIELD_LEN, PROTOCOL_ID};
use crate::protocol::PeerId;

/// TCP transport with a static address book
pub struct TcpTransport {
    local: PeerId,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<PeerId, SocketAddr>>,
    config: TransportConfig,
    incoming: Mutex<mpsc::Receiver<Arc<FramedStream>>>,
    acceptor: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind a listener for inbound streams
    ///
    /// Must be called from within a tokio runtime; the accept loop runs on
    /// its own task until the transport is dropped.
    pub async fn bind(
        local: impl Into<PeerId>,
        addr: SocketAddr,
        config: TransportConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let local = local.into();

        tracing::info!(peer = %local, addr = %local_addr, "TCP transport listening");

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let acceptor = tokio::spawn(accept_loop(listener, config.clone(), tx));

        Ok(Self {
            local,
            local_addr,
            peers: RwLock::new(HashMap::new()),
            config,
            incoming: Mutex::new(rx),
            acceptor,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record where a peer can be reached
    pub fn add_peer(&self, peer: impl Into<PeerId>, addr: SocketAddr) {
        self.peers.write().insert(peer.into(), addr);
    }

    pub fn remove_peer(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.peers.write().remove(peer)
    }

    async fn write_hello(&self, socket: &mut TcpStream) -> Result<()> {
        let mut hello = BytesMut::new();
        put_str(&mut hello, PROTOCOL_ID);
        put_str(&mut hello, self.local.as_str());
        socket.write_all(&hello).await?;
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    async fn open_stream(&self, peer: &PeerId) -> Result<Arc<FramedStream>> {
        let addr = self
            .peers
            .read()
            .get(peer)
            .copied()
            .ok_or_else(|| Error::PeerUnreachable(peer.clone()))?;

        let mut socket = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        configure_socket(&socket, &self.config)?;
        self.write_hello(&mut socket).await?;

        tracing::debug!(peer = %peer, addr = %addr, "TCP stream opened");
        Ok(Arc::new(FramedStream::from_io(
            peer.clone(),
            socket,
            self.config.max_frame_size,
        )))
    }

    async fn accept(&self) -> Result<Option<Arc<FramedStream>>> {
        Ok(self.incoming.lock().await.recv().await)
    }
}

fn configure_socket(socket: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    if config.tcp_nodelay {
        socket.set_nodelay(true)?;
    }
    Ok(())
}

async fn read_hello(socket: &mut TcpStream) -> Result<PeerId> {
    let protocol = read_text(socket, MAX_HELLO_FIELD_LEN).await?;
    if protocol != PROTOCOL_ID {
        return Err(ProtocolError::UnsupportedProtocol(protocol).into());
    }
    let peer = read_text(socket, MAX_HELLO_FIELD_LEN).await?;
    Ok(PeerId::new(peer))
}

async fn accept_loop(
    listener: TcpListener,
    config: TransportConfig,
    incoming: mpsc::Sender<Arc<FramedStream>>,
) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        if let Err(e) = configure_socket(&socket, &config) {
            tracing::error!(error = %e, "Failed to configure socket");
            continue;
        }

        tokio::spawn(handshake(socket, addr, config.clone(), incoming.clone()));
    }
}

async fn handshake(
    mut socket: TcpStream,
    addr: SocketAddr,
    config: TransportConfig,
    incoming: mpsc::Sender<Arc<FramedStream>>,
) {
    let peer = match tokio::time::timeout(config.handshake_timeout, read_hello(&mut socket)).await {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => {
            tracing::warn!(addr = %addr, error = %e, "Rejected connection hello");
            return;
        }
        Err(_) => {
            tracing::warn!(addr = %addr, "Connection hello timed out");
            return;
        }
    };

    tracing::debug!(peer = %peer, addr = %addr, "TCP stream accepted");
    let stream = Arc::new(FramedStream::from_io(peer, socket, config.max_frame_size));
    if incoming.send(stream).await.is_err() {
        tracing::debug!(addr = %addr, "Transport closed, dropping stream");
    }
}
