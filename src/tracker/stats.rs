//! Tracker and torrent statistics

use serde::{Deserialize, Serialize};

use crate::tracker::response::SwarmCounts;

/// Persisted statistics of one tracker
///
/// Counters not present in a response keep their previous value; a failure
/// keeps the counters and records the reason until the next success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStatsRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl TrackerStatsRecord {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Fold a successful response into the record
    pub fn merge_counts(&mut self, counts: &SwarmCounts) {
        self.complete = counts.complete.or(self.complete);
        self.downloaded = counts.downloaded.or(self.downloaded);
        self.incomplete = counts.incomplete.or(self.incomplete);
        self.name = counts.name.clone().or_else(|| self.name.take());
        self.failure_reason = None;
    }

    /// Record a failed response
    pub fn merge_failure(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
    }

    /// Caller-facing view of the record
    pub fn to_scrape_data(&self) -> ScrapeData {
        match &self.failure_reason {
            Some(reason) => ScrapeData::Failure { reason: reason.clone() },
            None => ScrapeData::Scrape {
                seeders: self.complete.unwrap_or(0),
                leechers: self.incomplete.unwrap_or(0),
                downloaded: self.downloaded.unwrap_or(0),
                name: self.name.clone(),
            },
        }
    }
}

/// Latest known state of a tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrapeData {
    Scrape {
        seeders: i64,
        leechers: i64,
        downloaded: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Failure {
        reason: String,
    },
}

/// Persisted transfer counters of a torrent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentStatsRecord {
    pub uploaded: u64,
    pub downloaded: u64,
    pub wasted: u64,
}

/// Transfer statistics of a torrent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentStats {
    /// Bytes sent to peers
    pub uploaded: u64,
    /// Bytes of verified pieces received
    pub downloaded: u64,
    /// Bytes still missing
    pub left: u64,
    /// Bytes received in pieces that failed the hash check
    pub wasted: u64,
    /// `uploaded / downloaded`, 0 before anything was downloaded
    pub share_ratio: f64,
    pub pieces: u64,
    pub have_pieces: u64,
}

impl TorrentStats {
    pub fn new(record: TorrentStatsRecord, left: u64, pieces: u64, have_pieces: u64) -> Self {
        let share_ratio = if record.downloaded == 0 {
            0.0
        } else {
            record.uploaded as f64 / record.downloaded as f64
        };
        Self {
            uploaded: record.uploaded,
            downloaded: record.downloaded,
            left,
            wasted: record.wasted,
            share_ratio,
            pieces,
            have_pieces,
        }
    }
}
