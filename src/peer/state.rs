//! Peer state module
//!
//! Defines peer identity, per-connection flags and piece bitmaps.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use crate::error::TorrentError;

/// A peer discovered through a tracker or an inbound connection
///
/// Equality, hashing and ordering use the numeric IP value and the port;
/// the peer id does not take part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeer {
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

impl KnownPeer {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            peer_id: None,
        }
    }

    pub fn with_peer_id(ip: impl Into<String>, port: u16, peer_id: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            peer_id: Some(peer_id.into()),
        }
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// Socket address of the peer
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.ip.parse().map_err(TorrentError::from)?;
        Ok(SocketAddr::new(ip, self.port))
    }

    // IPv4 sorts before IPv6, unparseable addresses last by text
    fn ip_key(&self) -> (u8, u128, &str) {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => (0, u32::from(v4) as u128, ""),
            Ok(IpAddr::V6(v6)) => (1, u128::from(v6), ""),
            Err(_) => (2, 0, self.ip.as_str()),
        }
    }
}

impl PartialEq for KnownPeer {
    fn eq(&self, other: &Self) -> bool {
        self.ip_key() == other.ip_key() && self.port == other.port
    }
}

impl Eq for KnownPeer {}

impl Hash for KnownPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip_key().hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for KnownPeer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KnownPeer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip_key().cmp(&other.ip_key()).then(self.port.cmp(&other.port))
    }
}

impl fmt::Display for KnownPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.ip, self.port),
            _ => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}

/// A peer with an established connection and its choke/interest flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub peer: KnownPeer,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
}

impl ConnectedPeer {
    /// State right after a handshake: choked and not interested both ways
    pub fn new(peer: KnownPeer) -> Self {
        Self {
            peer,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Pieces a peer has announced, MSB-first within each byte
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerBitmap {
    bitfield: Vec<u8>,
}

impl PeerBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole bitmap with a received bitfield payload
    pub fn update_bitfield(&mut self, bitfield: Vec<u8>) {
        self.bitfield = bitfield;
    }

    /// Mark one piece as held
    pub fn set_piece(&mut self, piece_index: usize) {
        let byte_index = piece_index / 8;
        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }
        self.bitfield[byte_index] |= 1 << (7 - (piece_index % 8));
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: usize) -> bool {
        let byte_index = piece_index / 8;
        let bit_index = 7 - (piece_index % 8);
        self.bitfield
            .get(byte_index)
            .is_some_and(|byte| (byte >> bit_index) & 1 == 1)
    }

    pub fn is_empty(&self) -> bool {
        self.bitfield.iter().all(|&b| b == 0)
    }
}

/// Encode held pieces as a bitfield payload
pub fn bitfield_from_pieces(have: &[bool]) -> Vec<u8> {
    let mut bitfield = vec![0u8; have.len().div_ceil(8)];
    for (i, held) in have.iter().enumerate() {
        if *held {
            bitfield[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    bitfield
}
