//! rust-torrent-client - Main entry point
//!
//! Loads a torrent into the persisted client state, optionally announces to
//! and scrapes its trackers, then prints what the trackers reported.

use anyhow::{Context, Result};
use rust_torrent_client::{
    CliArgs, ClientConfig, JsonFileStore, TorrentClient, TorrentError, TorrentParser, TrackerEvent,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized");
}

fn read_torrent(path: &Path) -> Result<Vec<u8>> {
    info!("Loading torrent file: {}", path.display());
    std::fs::read(path).map_err(|e| {
        error!("Failed to read torrent file '{}': {}", path.display(), e);
        anyhow::Error::from(TorrentError::invalid_torrent_with_source("Failed to read torrent file", e.to_string()))
    })
}

/// Load the torrent, or reuse it when an earlier run already did
async fn load_or_reuse(client: &TorrentClient, torrent: &[u8]) -> Result<String> {
    match client.load(torrent).await {
        Ok(infohash) => Ok(infohash),
        Err(e) => match e.downcast_ref::<TorrentError>() {
            Some(TorrentError::AlreadyLoaded { infohash }) => {
                info!("Torrent {} already in state, reusing it", infohash);
                Ok(infohash.clone())
            }
            _ => Err(e),
        },
    }
}

async fn print_report(client: &TorrentClient, infohash: &str) -> Result<()> {
    println!("Infohash: {}", infohash);

    println!("Trackers:");
    for (tier, trackers) in client.announces(infohash).await?.iter().enumerate() {
        println!("  tier {}: {}", tier, trackers.join(", "));
    }

    let peers = client.known_peers(infohash).await?;
    println!("Known peers ({}):", peers.len());
    for peer in &peers {
        match &peer.peer_id {
            Some(id) => println!("  {} ({})", peer, id),
            None => println!("  {}", peer),
        }
    }

    let stats = client.tracker_stats(infohash).await?;
    if !stats.is_empty() {
        println!("Tracker statistics:");
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    let torrent = client.torrent_stats(infohash).await?;
    println!(
        "Pieces: {}/{} held, {} bytes left",
        torrent.have_pieces, torrent.pieces, torrent.left
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = ClientConfig::from_args(&args);
    config.validate().context("Invalid configuration")?;

    // Fail early on a bad file, before touching the state
    let torrent = read_torrent(&args.torrent_file)?;
    let metainfo = TorrentParser::parse_bytes(&torrent).context("Failed to parse torrent file")?;
    debug!("Torrent has {} piece(s), {} bytes", metainfo.piece_count(), metainfo.total_size());

    let store = Arc::new(JsonFileStore::new(&args.state));
    let client = TorrentClient::with_defaults(config, store)?;
    let infohash = load_or_reuse(&client, &torrent).await?;

    if args.announce {
        let left = client.torrent_stats(&infohash).await?.left;
        match client.announce(&infohash, TrackerEvent::Started, 0, 0, left).await {
            Ok(interval) => info!("Announce succeeded, next in {}s", interval),
            Err(e) => warn!("Announce failed: {}", e),
        }
    }

    if args.scrape {
        client.scrape(&infohash).await.context("Scrape failed")?;
    }

    print_report(&client, &infohash).await
}
