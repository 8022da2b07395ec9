//! Tracker module
//!
//! Announce and scrape over HTTP, tier failover and tracker statistics.

pub mod announce_list;
pub mod client;
pub mod http;
pub mod request;
pub mod response;
pub mod stats;

pub use client::{AnnounceOutcome, AnnounceSuccess, TrackerClient, TrackerReply, TrackerReport, CONNECTION_FAILED};
#[cfg(feature = "http")]
pub use http::ReqwestHttpClient;
pub use http::HttpClient;
pub use request::{generate_peer_id, AnnounceCounters, TrackerEvent};
pub use response::{AnnounceResponse, PeerList, ScrapeResponse, SwarmCounts};
pub use stats::{ScrapeData, TorrentStats, TorrentStatsRecord, TrackerStatsRecord};
