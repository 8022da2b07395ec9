//! Peer management module
//!
//! Peer identity, transports, framed connections and the per-torrent
//! connection manager.

pub mod connection;
pub mod manager;
pub mod state;
pub mod transport;

// Re-export main types
pub use connection::PeerConnection;
pub use manager::PeerManager;
pub use state::{bitfield_from_pieces, ConnectedPeer, KnownPeer, PeerBitmap};
pub use transport::{BoxedStream, Listener, PeerStream, TcpTransport, Transport};
