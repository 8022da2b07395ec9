//! rust-torrent-client
//!
//! A BitTorrent client engine: Bencode, metainfo parsing, tracker announce
//! and scrape with tier failover, the peer wire protocol, and a peer
//! connection manager driving piece transfers.

pub mod bencode;
pub mod cli;
pub mod client;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use cli::{CliArgs, ClientConfig};
pub use client::TorrentClient;
pub use peer::{ConnectedPeer, KnownPeer, PeerManager, TcpTransport, Transport};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore, Records};
pub use torrent::{Metainfo, Piece, TorrentFile, TorrentParser};
pub use tracker::{HttpClient, ScrapeData, TorrentStats, TrackerClient, TrackerEvent};
