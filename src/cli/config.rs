//! Client configuration module
//!
//! Tunables shared by the tracker client, the peer manager and the listener.

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use anyhow::Result;
use std::time::Duration;

/// Lowest port the listener may bind
pub const MIN_LISTEN_PORT: u16 = 6881;
/// Highest port the listener may bind
pub const MAX_LISTEN_PORT: u16 = 6889;

/// Configuration for the torrent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port announced to trackers and bound by `start`
    pub listen_port: u16,
    /// Seed hashed into the peer id
    pub peer_id_seed: String,
    /// Bound on opening a peer connection and exchanging handshakes
    pub connect_timeout: Duration,
    /// Socket poll tick; a read with no data within it is not an error
    pub read_timeout: Duration,
    /// How long `send_piece` waits for further requests
    pub send_piece_window: Duration,
    /// Bound on waiting for a single requested block
    pub piece_timeout: Duration,
    /// Keep-alives are due this long after the previous round
    pub keep_alive_interval: Duration,
    /// Block size used when requesting pieces
    pub block_size: u32,
    /// Largest wire frame accepted from a peer
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_port: 6882,
            peer_id_seed: "rust-torrent-client".to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(100),
            send_piece_window: Duration::from_millis(100),
            piece_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(60),
            block_size: 1 << 14,
            max_frame_length: (1 << 17) + 13,
        }
    }
}

impl ClientConfig {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let mut config = Self {
            listen_port: args.port,
            ..Self::default()
        };
        if let Some(seed) = &args.peer_id_seed {
            config.peer_id_seed = seed.clone();
        }
        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(MIN_LISTEN_PORT..=MAX_LISTEN_PORT).contains(&self.listen_port) {
            return Err(TorrentError::config_error_with_field(
                format!("Port must be between {} and {}", MIN_LISTEN_PORT, MAX_LISTEN_PORT),
                "listen_port",
            )
            .into());
        }

        if self.read_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("read_timeout must be positive", "read_timeout").into());
        }

        if self.block_size == 0 {
            return Err(TorrentError::config_error_with_field("block_size must be at least 1", "block_size").into());
        }

        // A full block plus the piece header must fit in one frame
        if self.max_frame_length < self.block_size as usize + 9 {
            return Err(TorrentError::config_error_with_field(
                "max_frame_length is smaller than a block message",
                "max_frame_length",
            )
            .into());
        }

        Ok(())
    }
}
