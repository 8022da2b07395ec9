//! Tracker client
//!
//! Walks the announce list tier by tier over the HTTP port. Persisting the
//! outcome is left to the caller.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::peer::KnownPeer;
use crate::tracker::announce_list::{promote, shuffle_tiers};
use crate::tracker::http::HttpClient;
use crate::tracker::request::{announce_url, scrape_url, supports_scrape, AnnounceCounters, TrackerEvent};
use crate::tracker::response::{AnnounceResponse, ScrapeResponse, SwarmCounts};

/// Failure reason recorded when a tracker cannot be reached or answers garbage
pub const CONNECTION_FAILED: &str = "connection failed";

/// What one tracker answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerReply {
    Counts(SwarmCounts),
    Failure(String),
}

/// Reply of a single tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerReport {
    pub tracker: String,
    pub reply: TrackerReply,
}

impl TrackerReport {
    fn failure(tracker: &str, reason: impl Into<String>) -> Self {
        Self {
            tracker: tracker.to_string(),
            reply: TrackerReply::Failure(reason.into()),
        }
    }
}

/// The tracker that answered an announce
#[derive(Debug, Clone)]
pub struct AnnounceSuccess {
    pub tracker: String,
    pub interval: i64,
    pub peers: Vec<KnownPeer>,
}

/// Result of walking the announce list
#[derive(Debug, Clone)]
pub struct AnnounceOutcome {
    /// One report per tracker contacted, in contact order
    pub reports: Vec<TrackerReport>,
    pub success: Option<AnnounceSuccess>,
}

impl AnnounceOutcome {
    /// Reason of the last failure, if any tracker failed
    pub fn last_failure(&self) -> Option<&str> {
        self.reports.iter().rev().find_map(|report| match &report.reply {
            TrackerReply::Failure(reason) => Some(reason.as_str()),
            TrackerReply::Counts(_) => None,
        })
    }
}

/// Talks to the trackers of a torrent
#[derive(Clone)]
pub struct TrackerClient {
    http: Arc<dyn HttpClient>,
    peer_id: [u8; 20],
    port: u16,
}

impl TrackerClient {
    pub fn new(http: Arc<dyn HttpClient>, peer_id: [u8; 20], port: u16) -> Self {
        Self { http, peer_id, port }
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// Announce to the first tracker that answers
    ///
    /// A `Started` event shuffles every tier first. The tracker that answers
    /// is moved to the front of its tier. `tiers` is updated in place.
    pub async fn announce(
        &self,
        info_hash: &[u8; 20],
        tiers: &mut [Vec<String>],
        event: TrackerEvent,
        counters: AnnounceCounters,
    ) -> AnnounceOutcome {
        if event == TrackerEvent::Started {
            shuffle_tiers(tiers);
            debug!("Shuffled {} tier(s)", tiers.len());
        }

        let mut reports = Vec::new();
        let candidates: Vec<String> = tiers.iter().flatten().cloned().collect();
        for tracker in candidates {
            let url = announce_url(&tracker, info_hash, &self.peer_id, self.port, event, counters);
            debug!("Announcing to {}", tracker);

            let response = match self.http.get(&url).await {
                Ok(body) => AnnounceResponse::parse(&body),
                Err(e) => Err(e),
            };
            match response {
                Ok(AnnounceResponse::Success { interval, peers, counts }) => {
                    promote(tiers, &tracker);
                    let peers = peers.into_peers();
                    info!("Tracker {} returned {} peer(s), interval {}", tracker, peers.len(), interval);
                    reports.push(TrackerReport {
                        tracker: tracker.clone(),
                        reply: TrackerReply::Counts(counts),
                    });
                    return AnnounceOutcome {
                        reports,
                        success: Some(AnnounceSuccess { tracker, interval, peers }),
                    };
                }
                Ok(AnnounceResponse::Failure(reason)) => {
                    warn!("Tracker {} refused announce: {}", tracker, reason);
                    reports.push(TrackerReport::failure(&tracker, reason));
                }
                Err(e) => {
                    warn!("Tracker {} unreachable: {}", tracker, e);
                    reports.push(TrackerReport::failure(&tracker, CONNECTION_FAILED));
                }
            }
        }

        AnnounceOutcome { reports, success: None }
    }

    /// Scrape every tracker; never fails as a whole
    pub async fn scrape(&self, info_hash: &[u8; 20], trackers: &[String]) -> Vec<TrackerReport> {
        let mut reports = Vec::with_capacity(trackers.len());
        for tracker in trackers {
            if !supports_scrape(tracker) {
                debug!("Tracker {} does not support scrape", tracker);
                reports.push(TrackerReport::failure(tracker, CONNECTION_FAILED));
                continue;
            }

            let response = match scrape_url(tracker, info_hash) {
                Ok(url) => match self.http.get(&url).await {
                    Ok(body) => ScrapeResponse::parse(&body),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            let reply = match response {
                Ok(ScrapeResponse::Success(counts)) => TrackerReply::Counts(counts),
                Ok(ScrapeResponse::Failure(reason)) => TrackerReply::Failure(reason),
                Err(e) => {
                    warn!("Scrape of {} failed: {}", tracker, e);
                    TrackerReply::Failure(CONNECTION_FAILED.to_string())
                }
            };
            reports.push(TrackerReport {
                tracker: tracker.clone(),
                reply,
            });
        }
        reports
    }
}
