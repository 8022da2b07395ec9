//! Typed records over the key-value store
//!
//! Every record is Bencoded with `serde_bencode`. Keys are namespaced by
//! record kind and infohash; per-tracker statistics add `_<tracker URL>`.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::backend::KeyValueStore;
use crate::error::TorrentError;
use crate::peer::KnownPeer;
use crate::torrent::{Piece, TorrentFile};
use crate::tracker::{TorrentStatsRecord, TrackerStatsRecord};

/// Typed accessors for the client's persisted state
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn KeyValueStore>,
}

impl Records {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(kind: &str, infohash: &str) -> Vec<u8> {
        format!("{}/{}", kind, infohash).into_bytes()
    }

    fn tracker_key(infohash: &str, tracker: &str) -> Vec<u8> {
        format!("tracker-stats/{}_{}", infohash, tracker).into_bytes()
    }

    async fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        let Some(bytes) = self.store.read(key).await? else {
            return Ok(None);
        };
        trace!("Decoding {} byte record {}", bytes.len(), String::from_utf8_lossy(key));
        let value = serde_bencode::from_bytes(&bytes).map_err(|e| {
            error!("Failed to decode record {}: {}", String::from_utf8_lossy(key), e);
            TorrentError::storage_error_full("Failed to decode record", String::from_utf8_lossy(key), e.to_string())
        })?;
        Ok(Some(value))
    }

    async fn put<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_bencode::to_bytes(value).map_err(|e| {
            error!("Failed to encode record {}: {}", String::from_utf8_lossy(key), e);
            TorrentError::storage_error_full("Failed to encode record", String::from_utf8_lossy(key), e.to_string())
        })?;
        self.store.write(key, &bytes).await
    }

    /// Announce tiers; presence of this record means the torrent is loaded
    pub async fn announces(&self, infohash: &str) -> Result<Option<Vec<Vec<String>>>> {
        self.get(&Self::key("announces", infohash)).await
    }

    pub async fn set_announces(&self, infohash: &str, tiers: &[Vec<String>]) -> Result<()> {
        self.put(&Self::key("announces", infohash), &tiers).await
    }

    /// Known peers in registry order, empty when none were discovered yet
    pub async fn peers(&self, infohash: &str) -> Result<Vec<KnownPeer>> {
        Ok(self.get(&Self::key("peers", infohash)).await?.unwrap_or_default())
    }

    pub async fn set_peers(&self, infohash: &str, peers: &[KnownPeer]) -> Result<()> {
        self.put(&Self::key("peers", infohash), &peers).await
    }

    pub async fn pieces(&self, infohash: &str) -> Result<Option<Vec<Piece>>> {
        self.get(&Self::key("pieces", infohash)).await
    }

    pub async fn set_pieces(&self, infohash: &str, pieces: &[Piece]) -> Result<()> {
        self.put(&Self::key("pieces", infohash), &pieces).await
    }

    pub async fn files(&self, infohash: &str) -> Result<Option<Vec<TorrentFile>>> {
        self.get(&Self::key("files", infohash)).await
    }

    pub async fn set_files(&self, infohash: &str, files: &[TorrentFile]) -> Result<()> {
        self.put(&Self::key("files", infohash), &files).await
    }

    pub async fn torrent_stats(&self, infohash: &str) -> Result<Option<TorrentStatsRecord>> {
        self.get(&Self::key("torrent-stats", infohash)).await
    }

    pub async fn set_torrent_stats(&self, infohash: &str, stats: &TorrentStatsRecord) -> Result<()> {
        self.put(&Self::key("torrent-stats", infohash), stats).await
    }

    pub async fn tracker_stats(&self, infohash: &str, tracker: &str) -> Result<Option<TrackerStatsRecord>> {
        self.get(&Self::tracker_key(infohash, tracker)).await
    }

    pub async fn set_tracker_stats(&self, infohash: &str, tracker: &str, stats: &TrackerStatsRecord) -> Result<()> {
        self.put(&Self::tracker_key(infohash, tracker), stats).await
    }

    /// Delete every record of a torrent
    ///
    /// The announce record goes last, so a failure part-way leaves the
    /// torrent loaded and the call can be retried.
    pub async fn delete_torrent(&self, infohash: &str, trackers: &[String]) -> Result<()> {
        for tracker in trackers {
            self.store.delete(&Self::tracker_key(infohash, tracker)).await?;
        }
        for kind in ["peers", "pieces", "files", "torrent-stats", "announces"] {
            self.store.delete(&Self::key(kind, infohash)).await?;
        }
        debug!("Deleted records of {}", infohash);
        Ok(())
    }
}
