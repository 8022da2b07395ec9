//! Wire protocol utilities
//!
//! Framing helpers and the async handshake/message I/O used by peer
//! connections.

use anyhow::Result;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::HANDSHAKE_LENGTH;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// WireProtocol trait for protocol utilities
pub trait WireProtocol {
    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin + Send>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Clone, Copy)]
pub struct BitTorrentWire {
    /// Largest frame body accepted from a peer
    pub max_frame_length: usize,
}

impl BitTorrentWire {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    /// Pop the next complete frame out of `buf`, see [`read_message`]
    pub fn next_frame(&self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
        if buf.len() >= 4 {
            let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length > self.max_frame_length {
                error!("Frame of {} bytes exceeds limit of {}", length, self.max_frame_length);
                return Err(TorrentError::protocol_error_with_source(
                    "Frame too large",
                    format!("{} > {}", length, self.max_frame_length),
                )
                .into());
            }
        }
        read_message(buf)
    }
}

impl WireProtocol for BitTorrentWire {
    async fn write_message<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        let serialized = message.serialize();
        writer.write_all(&serialized).await.map_err(TorrentError::from)?;
        writer.flush().await.map_err(TorrentError::from)?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin + Send>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut data = [0u8; HANDSHAKE_LENGTH];
        reader.read_exact(&mut data).await.map_err(TorrentError::from)?;
        trace!("Read {} handshake bytes", data.len());
        Handshake::deserialize(&data)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        let serialized = handshake.serialize();
        writer.write_all(&serialized).await.map_err(TorrentError::from)?;
        writer.flush().await.map_err(TorrentError::from)?;
        Ok(())
    }
}

/// Read a length-prefixed message from the buffer
///
/// Returns `Ok(None)` until a whole frame is buffered. The returned frame
/// excludes the prefix; an empty frame is a keep-alive.
pub fn read_message(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + length {
        return Ok(None);
    }

    let message = buf[4..4 + length].to_vec();
    buf.advance(4 + length);

    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_read_message_frames() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"hello");
        buf.put_u32(0);

        assert_eq!(read_message(&mut buf).unwrap().unwrap(), b"hello");
        assert_eq!(read_message(&mut buf).unwrap().unwrap(), b"");
        assert!(read_message(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_read_message_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"hello");

        assert!(read_message(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_next_frame_rejects_oversized() {
        let wire = BitTorrentWire::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        assert!(wire.next_frame(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut wire = BitTorrentWire::new(1 << 17);
        let sent = Handshake::new([4u8; 20], [5u8; 20]);

        wire.write_handshake(&mut client, &sent).await.unwrap();
        let received = wire.read_handshake(&mut server).await.unwrap();
        assert_eq!(received, sent);

        wire.write_message(&mut server, &Message::Unchoke).await.unwrap();
        let mut raw = [0u8; 5];
        client.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 1, 1]);
    }

    #[tokio::test]
    async fn test_closed_stream_is_peer_connect_error() {
        let (client, mut server) = tokio::io::duplex(256);
        drop(client);
        let mut wire = BitTorrentWire::new(1 << 17);

        let err = wire.read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::PeerConnectError { .. })));
    }
}
