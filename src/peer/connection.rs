//! Peer connection module
//!
//! Framed message I/O over one peer stream.

use anyhow::Result;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, trace};

use crate::error::TorrentError;
use crate::peer::state::KnownPeer;
use crate::peer::transport::BoxedStream;
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};

/// An open stream to a peer with its receive buffer
pub struct PeerConnection {
    /// Remote peer
    pub peer: KnownPeer,
    stream: BoxedStream,
    read_buf: BytesMut,
    wire: BitTorrentWire,
}

impl PeerConnection {
    pub fn new(stream: BoxedStream, peer: KnownPeer, wire: BitTorrentWire) -> Self {
        Self {
            peer,
            stream,
            read_buf: BytesMut::with_capacity(1 << 15),
            wire,
        }
    }

    /// Send our handshake
    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<()> {
        debug!("Sending handshake to peer: {}", self.peer);
        self.wire.write_handshake(&mut self.stream, handshake).await.map_err(|e| {
            error!("Failed to send handshake to {}: {}", self.peer, e);
            TorrentError::peer_connect_full("Failed to send handshake", self.peer.to_string(), e.to_string()).into()
        })
    }

    /// Read the peer's handshake, waiting at most `limit`
    pub async fn receive_handshake(&mut self, limit: Duration) -> Result<Handshake> {
        debug!("Reading handshake from peer: {}", self.peer);
        timeout(limit, self.wire.read_handshake(&mut self.stream))
            .await
            .map_err(|e| TorrentError::peer_connect_full("Handshake timeout", self.peer.to_string(), e.to_string()))?
            .map_err(|e| {
                error!("Failed to read handshake from {}: {}", self.peer, e);
                TorrentError::peer_connect_full("Failed to read handshake", self.peer.to_string(), e.to_string()).into()
            })
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        trace!("Sending {:?} to peer: {}", message.message_id(), self.peer);
        self.wire.write_message(&mut self.stream, message).await.map_err(|e| {
            error!("Failed to send message to {}: {}", self.peer, e);
            TorrentError::peer_connect_full("Failed to send message", self.peer.to_string(), e.to_string()).into()
        })
    }

    /// Wait up to `tick` for the next message
    ///
    /// `Ok(None)` means nothing complete arrived in time. A frame that does
    /// not decode is consumed and reported as a `ProtocolFormatError`, so the
    /// stream stays aligned and the caller may keep reading. Any other error
    /// means the stream is unusable.
    pub async fn receive_message(&mut self, tick: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + tick;
        loop {
            if let Some(frame) = self.wire.next_frame(&mut self.read_buf)? {
                let message = Message::from_frame(&frame)?;
                debug!("Received {:?} from peer: {}", message.message_id(), self.peer);
                return Ok(Some(message));
            }

            // read_buf is cancel safe, a timeout never loses bytes
            match timeout_at(deadline, self.stream.read_buf(&mut self.read_buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    debug!("Peer {} closed the connection", self.peer);
                    return Err(TorrentError::peer_connect_with_peer("Connection closed by peer", self.peer.to_string()).into());
                }
                Ok(Ok(n)) => trace!("Read {} bytes from {}", n, self.peer),
                Ok(Err(e)) => {
                    error!("Failed to read from {}: {}", self.peer, e);
                    return Err(TorrentError::peer_connect_full("Failed to read message", self.peer.to_string(), e.to_string()).into());
                }
            }
        }
    }

    /// Close the stream without sending anything
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("Shutdown of {} failed: {}", self.peer, e);
        }
    }
}
