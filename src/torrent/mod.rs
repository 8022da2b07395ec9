//! Torrent metainfo handling
//!
//! Parses .torrent files into an infohash, an announce list, a piece table
//! and a file layout.

pub mod info;
pub mod parser;

pub use info::{Metainfo, Piece, TorrentFile};
pub use parser::TorrentParser;
