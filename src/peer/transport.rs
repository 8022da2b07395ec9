//! Transport port
//!
//! Byte streams to peers and the passive listener, abstracted so tests can
//! substitute in-process streams.

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::TorrentError;

/// A bidirectional byte stream to a peer
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens outbound streams and binds listeners
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream to `addr`, giving up after `connect_timeout`
    async fn connect(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<BoxedStream>;

    /// Bind a listener on `port`
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>>;
}

/// Accepts inbound streams
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<(BoxedStream, SocketAddr)>;

    /// Address the listener is bound to
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// TCP transport over `tokio::net`
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<BoxedStream> {
        debug!("Opening TCP connection to {}", addr);
        let socket = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", addr);
                TorrentError::peer_connect_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                error!("Failed to connect to {}: {}", addr, e);
                TorrentError::peer_connect_full("Failed to connect", addr.to_string(), e.to_string())
            })?;
        socket.set_nodelay(true).map_err(|e| {
            error!("Failed to configure connection to {}: {}", addr, e);
            TorrentError::peer_connect_full("Failed to configure socket", addr.to_string(), e.to_string())
        })?;
        Ok(Box::new(socket))
    }

    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            error!("Failed to bind port {}: {}", port, e);
            TorrentError::peer_connect_full("Failed to bind listener", format!("0.0.0.0:{}", port), e.to_string())
        })?;
        info!("Listening for peers on port {}", port);
        Ok(Box::new(TcpPeerListener { listener }))
    }
}

struct TcpPeerListener {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpPeerListener {
    async fn accept(&mut self) -> Result<(BoxedStream, SocketAddr)> {
        let (socket, addr) = self.listener.accept().await.map_err(|e| {
            warn!("Accept failed: {}", e);
            TorrentError::peer_connect_full("Failed to accept connection", "listener", e.to_string())
        })?;
        socket.set_nodelay(true).map_err(|e| {
            warn!("Failed to configure connection from {}: {}", addr, e);
            TorrentError::peer_connect_full("Failed to configure socket", addr.to_string(), e.to_string())
        })?;
        debug!("Accepted connection from {}", addr);
        Ok((Box::new(socket), addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
