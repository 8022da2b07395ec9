//! Tracker response decoding
//!
//! Responses are decoded into explicit variants: a failure, or a success
//! carrying either a compact or a dictionary peer list.

use anyhow::Result;
use std::net::Ipv4Addr;
use tracing::{trace, warn};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::peer::KnownPeer;

/// Peers as sent by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerList {
    /// 6 bytes per peer: IPv4 address then big-endian port
    Compact(Vec<u8>),
    /// One dictionary per peer with `ip`, `port` and optionally `peer id`
    Dicts(Vec<KnownPeer>),
}

impl PeerList {
    pub fn into_peers(self) -> Vec<KnownPeer> {
        match self {
            PeerList::Compact(bytes) => {
                if bytes.len() % 6 != 0 {
                    warn!("Compact peer list has {} trailing bytes", bytes.len() % 6);
                }
                bytes
                    .chunks_exact(6)
                    .map(|chunk| {
                        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        KnownPeer::new(ip.to_string(), port)
                    })
                    .collect()
            }
            PeerList::Dicts(peers) => peers,
        }
    }
}

/// Aggregate counters shared by announce and scrape responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmCounts {
    pub complete: Option<i64>,
    pub downloaded: Option<i64>,
    pub incomplete: Option<i64>,
    pub name: Option<String>,
}

impl SwarmCounts {
    fn from_dict(dict: &Value) -> Self {
        Self {
            complete: dict.get(b"complete").and_then(Value::as_integer),
            downloaded: dict.get(b"downloaded").and_then(Value::as_integer),
            incomplete: dict.get(b"incomplete").and_then(Value::as_integer),
            name: dict.get(b"name").and_then(Value::as_str).map(String::from),
        }
    }
}

/// Decoded announce response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceResponse {
    Failure(String),
    Success {
        interval: i64,
        peers: PeerList,
        counts: SwarmCounts,
    },
}

/// Decoded scrape response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeResponse {
    Failure(String),
    Success(SwarmCounts),
}

fn decode_dict(body: &[u8]) -> Result<Value> {
    let value = bencode::decode(body)?;
    if value.as_dict().is_none() {
        return Err(TorrentError::protocol_error("Tracker response is not a dictionary").into());
    }
    Ok(value)
}

fn failure_reason(value: &Value) -> Option<String> {
    value
        .get(b"failure reason")
        .and_then(Value::as_bytes)
        .map(|reason| String::from_utf8_lossy(reason).into_owned())
}

fn parse_peer_dict(entry: &Value) -> Option<KnownPeer> {
    let ip = entry.get(b"ip").and_then(Value::as_str)?;
    let port = entry.get(b"port").and_then(Value::as_integer)?;
    let port = u16::try_from(port).ok()?;
    let peer_id = entry
        .get(b"peer id")
        .and_then(Value::as_bytes)
        .map(|id| String::from_utf8_lossy(id).into_owned());
    Some(match peer_id {
        Some(id) => KnownPeer::with_peer_id(ip, port, id),
        None => KnownPeer::new(ip, port),
    })
}

impl AnnounceResponse {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value = decode_dict(body)?;
        if let Some(reason) = failure_reason(&value) {
            return Ok(AnnounceResponse::Failure(reason));
        }

        let peers = match value.get(b"peers") {
            Some(Value::Bytes(bytes)) => PeerList::Compact(bytes.to_vec()),
            Some(Value::List(entries)) => {
                let peers: Vec<KnownPeer> = entries.iter().filter_map(parse_peer_dict).collect();
                if peers.len() != entries.len() {
                    warn!("Skipped {} malformed peer entries", entries.len() - peers.len());
                }
                PeerList::Dicts(peers)
            }
            None => PeerList::Dicts(Vec::new()),
            Some(_) => return Err(TorrentError::protocol_error("Tracker peers field has wrong type").into()),
        };

        let interval = value.get(b"interval").and_then(Value::as_integer).unwrap_or(0);
        trace!("Announce response: interval {}", interval);
        Ok(AnnounceResponse::Success {
            interval,
            peers,
            counts: SwarmCounts::from_dict(&value),
        })
    }
}

impl ScrapeResponse {
    /// Decode a scrape response, reading the first entry of `files`
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value = decode_dict(body)?;
        if let Some(reason) = failure_reason(&value) {
            return Ok(ScrapeResponse::Failure(reason));
        }

        let entry = value
            .get(b"files")
            .and_then(Value::as_dict)
            .and_then(|files| files.values().next())
            .ok_or_else(|| TorrentError::protocol_error("Scrape response has no files entry"))?;
        Ok(ScrapeResponse::Success(SwarmCounts::from_dict(entry)))
    }
}
