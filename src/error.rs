//! Error types for the torrent client
//!
//! This module defines the error taxonomy shared by every component of the
//! client: metainfo parsing, tracker communication, the peer wire protocol
//! and the storage port.

use std::fmt;

/// Comprehensive error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Unknown infohash, unknown or unconnected peer, malformed caller input
    InvalidArgument {
        message: String,
        field: Option<String>,
    },

    /// Metainfo file could not be parsed
    InvalidTorrentFormat {
        message: String,
        source: Option<String>,
    },

    /// The infohash is already loaded
    AlreadyLoaded {
        infohash: String,
    },

    /// The client is not listening for peers
    NotListening,

    /// The client is already listening for peers
    AlreadyListening {
        port: u16,
    },

    /// Every tracker in the announce list failed
    TrackerFailure {
        reason: String,
    },

    /// Handshake or transport failure on a peer connection
    PeerConnectError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// The peer choked us before the piece was complete
    PeerChokedError {
        peer: String,
        piece: Option<u32>,
    },

    /// An assembled piece failed its SHA-1 check
    PieceHashError {
        piece: u32,
    },

    /// Malformed wire or bencode framing
    ProtocolFormatError {
        message: String,
        source: Option<String>,
    },

    /// Failure reported by the storage port
    StorageError {
        message: String,
        key: Option<String>,
        source: Option<String>,
    },

    /// Invalid client configuration
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new InvalidArgument error naming the offending field
    pub fn invalid_argument_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::InvalidArgument {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new InvalidTorrentFormat error
    pub fn invalid_torrent(message: impl Into<String>) -> Self {
        TorrentError::InvalidTorrentFormat {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new InvalidTorrentFormat error with source
    pub fn invalid_torrent_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::InvalidTorrentFormat {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn already_loaded(infohash: impl Into<String>) -> Self {
        TorrentError::AlreadyLoaded {
            infohash: infohash.into(),
        }
    }

    pub fn tracker_failure(reason: impl Into<String>) -> Self {
        TorrentError::TrackerFailure {
            reason: reason.into(),
        }
    }

    /// Create a new PeerConnectError with peer address
    pub fn peer_connect_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerConnectError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerConnectError with peer and source
    pub fn peer_connect_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerConnectError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    pub fn peer_choked(peer: impl Into<String>, piece: Option<u32>) -> Self {
        TorrentError::PeerChokedError {
            peer: peer.into(),
            piece,
        }
    }

    pub fn piece_hash(piece: u32) -> Self {
        TorrentError::PieceHashError { piece }
    }

    /// Create a new ProtocolFormatError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolFormatError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolFormatError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolFormatError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError with key and source
    pub fn storage_error_full(message: impl Into<String>, key: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            key: Some(key.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Whether this error comes from a malformed frame rather than a broken transport
    pub fn is_protocol_format(&self) -> bool {
        matches!(self, TorrentError::ProtocolFormatError { .. })
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::InvalidArgument { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Invalid argument: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Invalid argument: {}", message)
                }
            }
            TorrentError::InvalidTorrentFormat { message, source } => {
                if let Some(src) = source {
                    write!(f, "Invalid torrent format: {} (source: {})", message, src)
                } else {
                    write!(f, "Invalid torrent format: {}", message)
                }
            }
            TorrentError::AlreadyLoaded { infohash } => {
                write!(f, "Torrent already loaded: {}", infohash)
            }
            TorrentError::NotListening => write!(f, "Client is not listening"),
            TorrentError::AlreadyListening { port } => {
                write!(f, "Client is already listening on port {}", port)
            }
            TorrentError::TrackerFailure { reason } => {
                write!(f, "Tracker failure: {}", reason)
            }
            TorrentError::PeerConnectError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer connect error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer connect error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer connect error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer connect error: {}", message),
                }
            }
            TorrentError::PeerChokedError { peer, piece } => {
                if let Some(index) = piece {
                    write!(f, "Peer choked: {} (piece: {})", peer, index)
                } else {
                    write!(f, "Peer choked: {}", peer)
                }
            }
            TorrentError::PieceHashError { piece } => {
                write!(f, "Piece hash mismatch for piece {}", piece)
            }
            TorrentError::ProtocolFormatError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::StorageError { message, key, source } => {
                match (key, source) {
                    (Some(k), Some(s)) => write!(f, "Storage error: {} (key: {}, source: {})", message, k, s),
                    (Some(k), None) => write!(f, "Storage error: {} (key: {})", message, k),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::PeerConnectError {
            message: err.to_string(),
            peer: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::storage_error_full("Failed to encode state file", "state", err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::invalid_argument_with_field(format!("Failed to parse address: {}", err), "ip")
    }
}
