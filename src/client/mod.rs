//! Torrent client
//!
//! The composition root: owns the persisted records, the tracker client and
//! the peer manager, and exposes one method per public operation. Every
//! read-modify-write of a torrent's records runs under that torrent's lock;
//! different torrents never wait on each other.

use anyhow::Result;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cli::ClientConfig;
use crate::error::TorrentError;
use crate::peer::{BoxedStream, ConnectedPeer, KnownPeer, Listener, PeerManager, Transport};
use crate::registry::KeyedRegistry;
use crate::storage::{KeyValueStore, Records};
use crate::torrent::{Piece, TorrentFile, TorrentParser};
use crate::tracker::announce_list::all_trackers;
use crate::tracker::{
    generate_peer_id, AnnounceCounters, HttpClient, ScrapeData, TorrentStats, TorrentStatsRecord, TrackerClient,
    TrackerEvent, TrackerReply, TrackerReport,
};

#[cfg(test)]
mod tests;

/// Background tasks spawned by `start`
struct Background {
    addr: SocketAddr,
    accept: JoinHandle<()>,
    pump: JoinHandle<()>,
}

/// State shared with the background tasks
#[derive(Clone)]
struct Shared {
    config: Arc<ClientConfig>,
    records: Records,
    tracker: TrackerClient,
    peers: PeerManager,
    locks: Arc<KeyedRegistry<Mutex<()>>>,
}

fn parse_infohash(infohash: &str) -> Result<[u8; 20]> {
    let mut info_hash = [0u8; 20];
    hex::decode_to_slice(infohash, &mut info_hash)
        .map_err(|e| TorrentError::invalid_argument_with_field(format!("Malformed infohash: {}", e), "infohash"))?;
    Ok(info_hash)
}

fn have_vector(pieces: &[Piece]) -> Vec<bool> {
    pieces.iter().map(Piece::is_downloaded).collect()
}

fn piece_at(pieces: &[Piece], index: u32) -> Result<&Piece> {
    pieces.get(index as usize).ok_or_else(|| {
        error!("Piece index {} out of range ({} pieces)", index, pieces.len());
        TorrentError::invalid_argument_with_field(format!("No piece {}", index), "piece_index").into()
    })
}

/// Add `peer` unless already known; a newly learned peer id is recorded
fn upsert_peer(known: &mut Vec<KnownPeer>, peer: KnownPeer) -> bool {
    match known.iter_mut().find(|existing| **existing == peer) {
        Some(existing) => {
            if peer.peer_id.is_some() && existing.peer_id != peer.peer_id {
                existing.peer_id = peer.peer_id;
                true
            } else {
                false
            }
        }
        None => {
            known.push(peer);
            true
        }
    }
}

impl Shared {
    async fn lock(&self, infohash: &str) -> OwnedMutexGuard<()> {
        self.locks.get_or_insert_with(infohash, || Mutex::new(())).await.lock_owned().await
    }

    /// Lock a loaded torrent's records, returning its announce tiers
    ///
    /// Unknown infohashes are rejected before a lock entry is created.
    async fn lock_loaded(&self, infohash: &str) -> Result<(OwnedMutexGuard<()>, Vec<Vec<String>>)> {
        self.loaded(infohash).await?;
        let guard = self.lock(infohash).await;
        // Unloaded while we waited
        let tiers = self.loaded(infohash).await?;
        Ok((guard, tiers))
    }

    /// Announce tiers of a loaded torrent
    async fn loaded(&self, infohash: &str) -> Result<Vec<Vec<String>>> {
        self.records.announces(infohash).await?.ok_or_else(|| {
            error!("Torrent {} is not loaded", infohash);
            TorrentError::invalid_argument_with_field("Torrent is not loaded", infohash).into()
        })
    }

    async fn pieces(&self, infohash: &str) -> Result<Vec<Piece>> {
        self.records
            .pieces(infohash)
            .await?
            .ok_or_else(|| TorrentError::invalid_argument_with_field("Torrent is not loaded", infohash).into())
    }

    /// Piece table of a loaded torrent, with its connection state in place
    async fn swarm_pieces(&self, infohash: &str) -> Result<Vec<Piece>> {
        self.loaded(infohash).await?;
        let pieces = self.pieces(infohash).await?;
        self.peers.ensure_torrent(infohash, parse_infohash(infohash)?, pieces.len()).await;
        Ok(pieces)
    }

    async fn record_peer(&self, infohash: &str, peer: KnownPeer) -> Result<()> {
        let (_guard, _) = self.lock_loaded(infohash).await?;
        let mut known = self.records.peers(infohash).await?;
        if upsert_peer(&mut known, peer) {
            self.records.set_peers(infohash, &known).await?;
        }
        Ok(())
    }

    async fn update_stats(&self, infohash: &str, update: impl FnOnce(&mut TorrentStatsRecord)) -> Result<()> {
        let mut stats = self.records.torrent_stats(infohash).await?.unwrap_or_default();
        update(&mut stats);
        self.records.set_torrent_stats(infohash, &stats).await
    }

    async fn store_reports(&self, infohash: &str, reports: &[TrackerReport]) -> Result<()> {
        for report in reports {
            let mut stats = self.records.tracker_stats(infohash, &report.tracker).await?.unwrap_or_default();
            match &report.reply {
                TrackerReply::Counts(counts) => stats.merge_counts(counts),
                TrackerReply::Failure(reason) => stats.merge_failure(reason.clone()),
            }
            self.records.set_tracker_stats(infohash, &report.tracker, &stats).await?;
        }
        Ok(())
    }

    /// One pump round over every torrent with connection state
    async fn pump(&self) {
        let keep_alive = self.peers.keep_alive_due().await;
        for infohash in self.peers.torrents().await {
            let have = match self.pieces(&infohash).await {
                Ok(pieces) => Arc::new(have_vector(&pieces)),
                Err(e) => {
                    warn!("Skipping pump of {}: {}", infohash, e);
                    continue;
                }
            };
            self.peers.pump(&infohash, have, keep_alive).await;
        }
    }

    async fn handle_inbound(&self, stream: BoxedStream, addr: SocketAddr) -> Result<()> {
        let (mut conn, theirs) = self.peers.accept_handshake(stream, addr).await?;
        let infohash = hex::encode(theirs.info_hash);
        let pieces = match self.swarm_pieces(&infohash).await {
            Ok(pieces) => pieces,
            Err(e) => {
                debug!("Rejecting inbound peer {} for {}: {}", addr, infohash, e);
                conn.shutdown().await;
                return Ok(());
            }
        };

        let peer = self.peers.complete_inbound(&infohash, conn, &theirs, &have_vector(&pieces)).await?;
        self.record_peer(&infohash, peer).await
    }

    async fn accept_loop(self, mut listener: Box<dyn Listener>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let shared = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shared.handle_inbound(stream, addr).await {
                            warn!("Inbound connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(self.config.read_timeout).await;
                }
            }
        }
    }

    async fn pump_loop(self) {
        let mut ticker = interval(self.config.read_timeout.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.pump().await;
        }
    }
}

/// A BitTorrent client over abstract storage, HTTP and transport ports
pub struct TorrentClient {
    shared: Shared,
    background: Mutex<Option<Background>>,
}

impl TorrentClient {
    /// Create a client; the peer id is fixed for the client's lifetime
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn KeyValueStore>,
        http: Arc<dyn HttpClient>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let peer_id = generate_peer_id(&config.peer_id_seed);
        info!("Client peer id: {}", String::from_utf8_lossy(&peer_id));
        let config = Arc::new(config);
        Self {
            shared: Shared {
                tracker: TrackerClient::new(http, peer_id, config.listen_port),
                peers: PeerManager::new(config.clone(), transport, peer_id),
                records: Records::new(store),
                locks: Arc::new(KeyedRegistry::new()),
                config,
            },
            background: Mutex::new(None),
        }
    }

    /// Client over real HTTP and TCP
    #[cfg(feature = "http")]
    pub fn with_defaults(config: ClientConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let http = Arc::new(crate::tracker::ReqwestHttpClient::new()?);
        Ok(Self::new(config, store, http, Arc::new(crate::peer::TcpTransport)))
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.shared.peers.peer_id()
    }

    /// Load a torrent from its metainfo bytes, returning the infohash
    pub async fn load(&self, torrent: &[u8]) -> Result<String> {
        let metainfo = TorrentParser::parse_bytes(torrent)?;
        let infohash = metainfo.info_hash_hex();

        let _guard = self.shared.lock(&infohash).await;
        if self.shared.records.announces(&infohash).await?.is_some() {
            error!("Torrent {} is already loaded", infohash);
            return Err(TorrentError::already_loaded(infohash).into());
        }

        let records = &self.shared.records;
        records.set_pieces(&infohash, &metainfo.pieces).await?;
        records.set_files(&infohash, &metainfo.files).await?;
        records.set_torrent_stats(&infohash, &TorrentStatsRecord::default()).await?;
        // Written last: its presence marks the torrent as loaded
        records.set_announces(&infohash, &metainfo.announce_list).await?;

        self.shared
            .peers
            .ensure_torrent(&infohash, metainfo.info_hash, metainfo.piece_count())
            .await;
        info!("Loaded torrent {} ({} pieces)", infohash, metainfo.piece_count());
        Ok(infohash)
    }

    /// Close a torrent's connections and delete all of its records
    pub async fn unload(&self, infohash: &str) -> Result<()> {
        let (_guard, tiers) = self.shared.lock_loaded(infohash).await?;

        self.shared.peers.remove_torrent(infohash).await;
        self.shared.records.delete_torrent(infohash, &all_trackers(&tiers)).await?;
        self.shared.locks.remove(infohash).await;
        info!("Unloaded torrent {}", infohash);
        Ok(())
    }

    /// Current announce tiers
    pub async fn announces(&self, infohash: &str) -> Result<Vec<Vec<String>>> {
        self.shared.loaded(infohash).await
    }

    /// Announce to the trackers, returning the interval of the one that answered
    pub async fn announce(
        &self,
        infohash: &str,
        event: TrackerEvent,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<i64> {
        let (_guard, mut tiers) = self.shared.lock_loaded(infohash).await?;
        let info_hash = parse_infohash(infohash)?;

        let counters = AnnounceCounters { uploaded, downloaded, left };
        let outcome = self.shared.tracker.announce(&info_hash, &mut tiers, event, counters).await;
        self.shared.records.set_announces(infohash, &tiers).await?;
        self.shared.store_reports(infohash, &outcome.reports).await?;

        let Some(success) = outcome.success else {
            let reason = outcome.last_failure().unwrap_or("no trackers").to_string();
            error!("Every tracker of {} failed: {}", infohash, reason);
            return Err(TorrentError::tracker_failure(reason).into());
        };

        let mut known = self.shared.records.peers(infohash).await?;
        let before = known.len();
        for peer in success.peers {
            upsert_peer(&mut known, peer);
        }
        self.shared.records.set_peers(infohash, &known).await?;
        info!(
            "Announced {} to {}: {} new peer(s)",
            infohash,
            success.tracker,
            known.len() - before
        );
        Ok(success.interval)
    }

    /// Scrape every tracker and record the results
    pub async fn scrape(&self, infohash: &str) -> Result<()> {
        let (_guard, tiers) = self.shared.lock_loaded(infohash).await?;
        let info_hash = parse_infohash(infohash)?;

        let reports = self.shared.tracker.scrape(&info_hash, &all_trackers(&tiers)).await;
        self.shared.store_reports(infohash, &reports).await?;
        debug!("Scraped {} tracker(s) of {}", reports.len(), infohash);
        Ok(())
    }

    /// Forget a known peer; unknown peers are ignored
    pub async fn invalidate_peer(&self, infohash: &str, peer: &KnownPeer) -> Result<()> {
        let (_guard, _) = self.shared.lock_loaded(infohash).await?;

        let mut known = self.shared.records.peers(infohash).await?;
        let before = known.len();
        known.retain(|existing| existing != peer);
        if known.len() != before {
            self.shared.records.set_peers(infohash, &known).await?;
            debug!("Invalidated peer {}", peer);
        }
        Ok(())
    }

    /// Known peers ordered by numeric IP, then port
    pub async fn known_peers(&self, infohash: &str) -> Result<Vec<KnownPeer>> {
        self.shared.loaded(infohash).await?;
        let mut known = self.shared.records.peers(infohash).await?;
        known.sort();
        Ok(known)
    }

    /// Latest statistics of every tracker that ever answered
    pub async fn tracker_stats(&self, infohash: &str) -> Result<BTreeMap<String, ScrapeData>> {
        let tiers = self.shared.loaded(infohash).await?;
        let mut stats = BTreeMap::new();
        for tracker in all_trackers(&tiers) {
            if let Some(record) = self.shared.records.tracker_stats(infohash, &tracker).await? {
                stats.insert(tracker, record.to_scrape_data());
            }
        }
        Ok(stats)
    }

    pub async fn torrent_stats(&self, infohash: &str) -> Result<TorrentStats> {
        self.shared.loaded(infohash).await?;
        let pieces = self.shared.pieces(infohash).await?;
        let record = self.shared.records.torrent_stats(infohash).await?.unwrap_or_default();

        let left = pieces.iter().filter(|p| !p.is_downloaded()).map(|p| u64::from(p.length)).sum();
        let have = pieces.iter().filter(|p| p.is_downloaded()).count() as u64;
        Ok(TorrentStats::new(record, left, pieces.len() as u64, have))
    }

    /// Start listening for peers and spawn the pump
    pub async fn start(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if let Some(running) = background.as_ref() {
            error!("Already listening on {}", running.addr);
            return Err(TorrentError::AlreadyListening { port: running.addr.port() }.into());
        }

        let listener = self.shared.peers.listen(self.shared.config.listen_port).await?;
        let addr = listener.local_addr()?;
        let accept = tokio::spawn(self.shared.clone().accept_loop(listener));
        let pump = tokio::spawn(self.shared.clone().pump_loop());
        *background = Some(Background { addr, accept, pump });
        info!("Client started on {}", addr);
        Ok(())
    }

    /// Stop the background tasks and close every peer connection
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.background.lock().await.take() else {
            error!("Stop called while not listening");
            return Err(TorrentError::NotListening.into());
        };
        running.accept.abort();
        running.pump.abort();
        // Wait for the tasks to release the listener and any held connection
        let _ = running.accept.await;
        let _ = running.pump.await;
        self.shared.peers.close_all().await;
        info!("Client stopped");
        Ok(())
    }

    /// Address the listener is bound to, while started
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.background.lock().await.as_ref().map(|running| running.addr)
    }

    /// Run one round of the peer pump
    ///
    /// `start` runs this continuously; without it, inbound messages are only
    /// read when this is called.
    pub async fn pump(&self) {
        self.shared.pump().await;
    }

    /// Connect to a known peer
    pub async fn connect(&self, infohash: &str, peer: &KnownPeer) -> Result<()> {
        let pieces = self.shared.swarm_pieces(infohash).await?;
        let known = self.shared.records.peers(infohash).await?;
        if !known.contains(peer) {
            error!("Peer {} is not known for {}", peer, infohash);
            return Err(TorrentError::invalid_argument_with_field("Unknown peer", peer.to_string()).into());
        }

        if let Some(peer_id) = self.shared.peers.connect(infohash, peer, &have_vector(&pieces)).await? {
            self.shared
                .record_peer(infohash, KnownPeer::with_peer_id(peer.ip.clone(), peer.port, peer_id))
                .await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self, infohash: &str, peer: &KnownPeer) -> Result<()> {
        self.shared.loaded(infohash).await?;
        self.shared.peers.disconnect(infohash, peer).await
    }

    /// Live connections, sorted by peer
    pub async fn connected_peers(&self, infohash: &str) -> Result<Vec<ConnectedPeer>> {
        self.shared.loaded(infohash).await?;
        Ok(self.shared.peers.connected_peers(infohash).await)
    }

    pub async fn choke(&self, infohash: &str, peer: &KnownPeer) -> Result<()> {
        self.shared.swarm_pieces(infohash).await?;
        self.shared.peers.set_choking(infohash, peer, true).await
    }

    pub async fn unchoke(&self, infohash: &str, peer: &KnownPeer) -> Result<()> {
        self.shared.swarm_pieces(infohash).await?;
        self.shared.peers.set_choking(infohash, peer, false).await
    }

    /// Download and verify one piece from `peer`
    ///
    /// On success the piece is stored and announced to the other peers. A
    /// hash mismatch leaves the piece not downloaded and counts as waste.
    pub async fn request_piece(&self, infohash: &str, peer: &KnownPeer, piece_index: u32) -> Result<()> {
        let pieces = self.shared.swarm_pieces(infohash).await?;
        let piece = piece_at(&pieces, piece_index)?.clone();

        let data = match self.shared.peers.request_piece(infohash, peer, &piece).await {
            Ok(data) => data,
            Err(e) => {
                if matches!(e.downcast_ref::<TorrentError>(), Some(TorrentError::PieceHashError { .. })) {
                    if let Ok((_guard, _)) = self.shared.lock_loaded(infohash).await {
                        self.shared
                            .update_stats(infohash, |stats| stats.wasted += u64::from(piece.length))
                            .await?;
                    }
                }
                return Err(e);
            }
        };

        {
            let (_guard, _) = self.shared.lock_loaded(infohash).await?;
            let mut pieces = self.shared.pieces(infohash).await?;
            let Some(stored) = pieces.get_mut(piece_index as usize) else {
                return Err(TorrentError::invalid_argument_with_field("No such piece", "piece_index").into());
            };
            stored.data = Some(data);
            self.shared.records.set_pieces(infohash, &pieces).await?;
            self.shared
                .update_stats(infohash, |stats| stats.downloaded += u64::from(piece.length))
                .await?;
        }

        self.shared.peers.broadcast_have(infohash, piece_index, peer).await;
        Ok(())
    }

    /// Serve `peer`'s pending requests for one piece
    pub async fn send_piece(&self, infohash: &str, peer: &KnownPeer, piece_index: u32) -> Result<()> {
        let pieces = self.shared.swarm_pieces(infohash).await?;
        let piece = piece_at(&pieces, piece_index)?;

        let uploaded = self.shared.peers.send_piece(infohash, peer, piece).await?;
        if uploaded > 0 {
            let (_guard, _) = self.shared.lock_loaded(infohash).await?;
            self.shared.update_stats(infohash, |stats| stats.uploaded += uploaded).await?;
        }
        Ok(())
    }

    /// Up to `per_peer` pieces per unchoking peer that we still need
    pub async fn available_pieces(
        &self,
        infohash: &str,
        per_peer: usize,
        start_index: usize,
    ) -> Result<BTreeMap<KnownPeer, Vec<u32>>> {
        let pieces = self.shared.swarm_pieces(infohash).await?;
        Ok(self
            .shared
            .peers
            .available_pieces(infohash, &have_vector(&pieces), per_peer, start_index)
            .await)
    }

    /// Pieces each connected peer has pending requests for
    pub async fn requested_pieces(&self, infohash: &str) -> Result<BTreeMap<KnownPeer, Vec<u32>>> {
        self.shared.loaded(infohash).await?;
        Ok(self.shared.peers.requested_pieces(infohash).await)
    }

    /// Reconstruct every file; bytes not downloaded yet are zero
    pub async fn files(&self, infohash: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        self.shared.loaded(infohash).await?;
        let pieces = self.shared.pieces(infohash).await?;
        let layout = self.layout(infohash).await?;

        let mut files = BTreeMap::new();
        let mut piece_offset = 0u64;
        let mut spans = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            spans.push((piece_offset, piece));
            piece_offset += u64::from(piece.length);
        }

        for file in &layout {
            let mut content = vec![0u8; file.length as usize];
            let file_end = file.offset + file.length;
            for (start, piece) in &spans {
                let Some(data) = piece.data.as_deref() else { continue };
                let end = start + data.len() as u64;
                if end <= file.offset || *start >= file_end {
                    continue;
                }
                let from = file.offset.max(*start);
                let to = file_end.min(end);
                content[(from - file.offset) as usize..(to - file.offset) as usize]
                    .copy_from_slice(&data[(from - start) as usize..(to - start) as usize]);
            }
            files.insert(file.name.clone(), content);
        }
        Ok(files)
    }

    /// Replace the piece contents with the given files, without verification
    ///
    /// Missing files count as zeroes, short files are zero-padded and long
    /// ones truncated; names not in the torrent are ignored.
    pub async fn load_files(&self, infohash: &str, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let (_guard, _) = self.shared.lock_loaded(infohash).await?;
        let mut pieces = self.shared.pieces(infohash).await?;
        let layout = self.layout(infohash).await?;

        let total: u64 = layout.iter().map(|f| f.length).sum();
        let mut stream = vec![0u8; total as usize];
        for file in &layout {
            if let Some(content) = files.get(&file.name) {
                let len = content.len().min(file.length as usize);
                let start = file.offset as usize;
                stream[start..start + len].copy_from_slice(&content[..len]);
            }
        }

        let mut offset = 0usize;
        for piece in pieces.iter_mut() {
            let end = (offset + piece.length as usize).min(stream.len());
            piece.data = Some(stream[offset..end].to_vec());
            offset = end;
        }
        self.shared.records.set_pieces(infohash, &pieces).await?;
        debug!("Loaded {} file(s) into {}", layout.len(), infohash);
        Ok(())
    }

    /// Verify every held piece, dropping the ones that fail
    ///
    /// Returns true when every piece is held and valid.
    pub async fn recheck(&self, infohash: &str) -> Result<bool> {
        let (_guard, _) = self.shared.lock_loaded(infohash).await?;
        let mut pieces = self.shared.pieces(infohash).await?;

        let mut complete = true;
        let mut changed = false;
        for piece in pieces.iter_mut() {
            match piece.data.as_deref() {
                Some(data) if piece.verify(data) => {}
                Some(_) => {
                    warn!("Piece {} of {} failed recheck", piece.index, infohash);
                    piece.data = None;
                    changed = true;
                    complete = false;
                }
                None => complete = false,
            }
        }
        if changed {
            self.shared.records.set_pieces(infohash, &pieces).await?;
        }
        info!("Recheck of {}: {}", infohash, if complete { "complete" } else { "incomplete" });
        Ok(complete)
    }

    async fn layout(&self, infohash: &str) -> Result<Vec<TorrentFile>> {
        self.shared
            .records
            .files(infohash)
            .await?
            .ok_or_else(|| TorrentError::invalid_argument_with_field("Torrent is not loaded", infohash).into())
    }
}
