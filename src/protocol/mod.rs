//! BitTorrent protocol module
//!
//! Implements the peer wire protocol codec.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LENGTH, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{read_message, BitTorrentWire, WireProtocol};
