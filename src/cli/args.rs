//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the torrent client
#[derive(Debug, Parser)]
#[command(name = "rust-torrent-client")]
#[command(about = "Load a torrent, talk to its trackers and report what they say", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// JSON file holding client state between runs
    #[arg(short, long, value_name = "FILE", default_value = "torrent-state.json")]
    pub state: PathBuf,

    /// Listening port announced to trackers (6881-6889)
    #[arg(short, long, default_value_t = 6882)]
    pub port: u16,

    /// Seed for the generated peer id
    #[arg(long, value_name = "SEED")]
    pub peer_id_seed: Option<String>,

    /// Announce to the trackers with the `started` event
    #[arg(long)]
    pub announce: bool,

    /// Scrape every scrape-capable tracker
    #[arg(long)]
    pub scrape: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
