//! Tracker request URLs and the client peer id

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::TorrentError;

/// Client prefix of every peer id we generate
pub const PEER_ID_PREFIX: &str = "-CS1000-";

/// Announce event sent to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
    /// Periodic announce; sends no `event` parameter
    Regular,
}

impl TrackerEvent {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            TrackerEvent::Started => Some("started"),
            TrackerEvent::Stopped => Some("stopped"),
            TrackerEvent::Completed => Some("completed"),
            TrackerEvent::Regular => None,
        }
    }
}

/// Transfer counters reported with an announce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceCounters {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Build the peer id: prefix, 6 hex chars of SHA-1(`seed`), 6 random alphanumerics
pub fn generate_peer_id(seed: &str) -> [u8; 20] {
    let digest = hex::encode(Sha1::digest(seed.as_bytes()));
    let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(6).map(char::from).collect();

    let mut peer_id = [0u8; 20];
    let text = format!("{}{}{}", PEER_ID_PREFIX, &digest[..6], suffix);
    peer_id.copy_from_slice(text.as_bytes());
    peer_id
}

fn separator(base: &str) -> char {
    if base.contains('?') {
        '&'
    } else {
        '?'
    }
}

/// Announce URL for `tracker`
pub fn announce_url(
    tracker: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    event: TrackerEvent,
    counters: AnnounceCounters,
) -> String {
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        tracker,
        separator(tracker),
        urlencoding::encode_binary(info_hash),
        urlencoding::encode_binary(peer_id),
        port,
        counters.uploaded,
        counters.downloaded,
        counters.left
    );
    if let Some(event) = event.as_str() {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments().and_then(|mut segments| segments.next_back())
}

/// Whether `tracker` follows the scrape convention
pub fn supports_scrape(tracker: &str) -> bool {
    Url::parse(tracker)
        .ok()
        .as_ref()
        .and_then(last_segment)
        .is_some_and(|segment| segment.starts_with("announce"))
}

/// Scrape URL for `tracker`: the `announce` in the last path segment becomes `scrape`
pub fn scrape_url(tracker: &str, info_hash: &[u8; 20]) -> Result<String> {
    let mut url = Url::parse(tracker)
        .map_err(|e| TorrentError::invalid_argument_with_field(format!("Invalid tracker URL: {}", e), "tracker"))?;
    let segment = last_segment(&url)
        .filter(|segment| segment.starts_with("announce"))
        .map(|segment| format!("scrape{}", &segment["announce".len()..]))
        .ok_or_else(|| TorrentError::invalid_argument_with_field("Tracker does not support scrape", tracker))?;

    url.path_segments_mut()
        .map_err(|_| TorrentError::invalid_argument_with_field("Tracker URL has no path", tracker))?
        .pop()
        .push(&segment);

    let base = url.to_string();
    Ok(format!("{}{}info_hash={}", base, separator(&base), urlencoding::encode_binary(info_hash)))
}
