//! BitTorrent protocol messages
//!
//! Defines the length-prefixed peer wire messages.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source("Invalid message ID", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive | Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
        }

        trace!("Message {:?} serialized: {} bytes", self.message_id(), buf.len());
        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    ///
    /// Fails when fewer bytes are present than the prefix declares.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            error!("Message data too short for length prefix: {} bytes", data.len());
            return Err(TorrentError::protocol_error("Message data too short for length prefix").into());
        }
        let mut buf = data;
        let length = buf.get_u32() as usize;
        if buf.remaining() < length {
            error!("Message truncated: declared {} bytes, got {}", length, buf.remaining());
            return Err(TorrentError::protocol_error_with_source(
                "Message truncated",
                format!("declared {} bytes, got {}", length, buf.remaining()),
            )
            .into());
        }
        Self::from_frame(&buf[..length])
    }

    /// Decode a frame body (message id + payload, without the length prefix)
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        if !buf.has_remaining() {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(buf.get_u8())?;
        trace!("Decoding {:?} with {} payload bytes", message_id, buf.remaining());

        let expect = |needed: usize, exact: bool, name: &str, remaining: usize| -> Result<()> {
            if remaining < needed || (exact && remaining != needed) {
                error!("{} message has bad payload: expected {} bytes, got {}", name, needed, remaining);
                return Err(TorrentError::protocol_error_with_source(
                    format!("{} message has bad payload", name),
                    format!("expected {} bytes, got {}", needed, remaining),
                )
                .into());
            }
            Ok(())
        };

        match message_id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                expect(4, true, "Have", buf.remaining())?;
                Ok(Message::Have { piece_index: buf.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield { bitfield: buf.to_vec() }),
            MessageId::Request | MessageId::Cancel => {
                expect(12, true, if message_id == MessageId::Request { "Request" } else { "Cancel" }, buf.remaining())?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let length = buf.get_u32();
                if message_id == MessageId::Request {
                    Ok(Message::Request { index, begin, length })
                } else {
                    Ok(Message::Cancel { index, begin, length })
                }
            }
            MessageId::Piece => {
                expect(8, false, "Piece", buf.remaining())?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Ok(Message::Piece { index, begin, block: buf.to_vec() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_layouts() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(Message::Choke.serialize(), vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::NotInterested.serialize(), vec![0, 0, 0, 1, 3]);
        assert_eq!(Message::Have { piece_index: 258 }.serialize(), vec![0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(
            Message::Request { index: 1, begin: 16384, length: 16384 }.serialize(),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(
            Message::Piece { index: 2, begin: 0, block: vec![9, 9] }.serialize(),
            vec![0, 0, 0, 11, 7, 0, 0, 0, 2, 0, 0, 0, 0, 9, 9]
        );
    }

    #[test]
    fn test_deserialize_each_kind() {
        let messages = vec![
            Message::KeepAlive,
            Message::Unchoke,
            Message::Interested,
            Message::Bitfield { bitfield: vec![0b1010_0000] },
            Message::Cancel { index: 3, begin: 4, length: 5 },
            Message::Piece { index: 10, begin: 0, block: vec![1, 2, 3, 4, 5] },
        ];
        for message in messages {
            assert_eq!(Message::deserialize(&message.serialize()).unwrap(), message);
        }
    }

    #[test]
    fn test_deserialize_rejects_truncated_frame() {
        let mut data = Message::Have { piece_index: 1 }.serialize();
        data.pop();
        assert!(Message::deserialize(&data).is_err());
    }

    #[test]
    fn test_deserialize_rejects_unknown_id() {
        let err = Message::deserialize(&[0, 0, 0, 3, 9, 0x1a, 0xe1]).unwrap_err();
        assert!(err.downcast_ref::<TorrentError>().unwrap().is_protocol_format());
        assert!(Message::from_frame(&[20, 0]).is_err());
    }

    #[test]
    fn test_from_frame_rejects_short_payloads() {
        assert!(Message::from_frame(&[4, 0, 0]).is_err());
        assert!(Message::from_frame(&[6, 0, 0, 0, 1]).is_err());
        assert!(Message::from_frame(&[7, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(8).unwrap(), MessageId::Cancel);
        assert!(MessageId::try_from(9).is_err());
    }
}
