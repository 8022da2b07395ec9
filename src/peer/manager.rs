//! Peer manager module
//!
//! Owns every peer connection of every torrent: the handshake, the
//! choke/interest state machine, piece bitmaps, pending requests and the
//! block transfers in both directions.
//!
//! Per-torrent state lives in a [`Swarm`] behind its own mutex. Each live
//! stream sits in a [`PeerLink`] with a separate lock, and the swarm lock is
//! never held across stream I/O.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::cli::ClientConfig;
use crate::error::TorrentError;
use crate::peer::connection::PeerConnection;
use crate::peer::state::{bitfield_from_pieces, ConnectedPeer, KnownPeer, PeerBitmap};
use crate::peer::transport::{BoxedStream, Listener, Transport};
use crate::protocol::{BitTorrentWire, Handshake, Message};
use crate::registry::KeyedRegistry;
use crate::torrent::Piece;

/// Upper bound on messages drained from one peer per pump tick
const MAX_MESSAGES_PER_TICK: usize = 64;

/// A live stream shared between the pump and the transfer operations
#[derive(Clone)]
struct PeerLink {
    conn: Arc<Mutex<PeerConnection>>,
    closed: Arc<AtomicBool>,
}

impl PeerLink {
    fn new(conn: PeerConnection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn same(&self, other: &PeerLink) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed and shut the stream down if nobody is using it; a busy
    /// user notices the flag on its next tick.
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut conn) = self.conn.try_lock() {
            conn.shutdown().await;
        }
    }
}

struct PeerSlot {
    peer: ConnectedPeer,
    /// `None` for a slot whose stream is gone (bad handshake or I/O failure)
    link: Option<PeerLink>,
    bitmap: PeerBitmap,
    /// piece index -> begin offset -> block length
    requests: BTreeMap<u32, BTreeMap<u32, u32>>,
}

impl PeerSlot {
    fn new(peer: KnownPeer, link: Option<PeerLink>) -> Self {
        Self {
            peer: ConnectedPeer::new(peer),
            link,
            bitmap: PeerBitmap::new(),
            requests: BTreeMap::new(),
        }
    }

    fn live_link(&self, other: &PeerLink) -> bool {
        self.link.as_ref().is_some_and(|l| l.same(other))
    }

    fn apply(&mut self, message: &Message, piece_count: usize) {
        let addr = &self.peer.peer;
        match message {
            Message::KeepAlive => trace!("Keep-alive from {}", addr),
            Message::Choke => self.peer.peer_choking = true,
            Message::Unchoke => self.peer.peer_choking = false,
            Message::Interested => self.peer.peer_interested = true,
            Message::NotInterested => self.peer.peer_interested = false,
            Message::Have { piece_index } => {
                if (*piece_index as usize) < piece_count {
                    self.bitmap.set_piece(*piece_index as usize);
                } else {
                    warn!("Peer {} announced piece {} out of range", addr, piece_index);
                }
            }
            Message::Bitfield { bitfield } => self.bitmap.update_bitfield(bitfield.clone()),
            Message::Request { index, begin, length } => {
                if self.peer.am_choking {
                    debug!("Ignoring request from choked peer {}", addr);
                } else if (*index as usize) < piece_count {
                    self.requests.entry(*index).or_default().insert(*begin, *length);
                } else {
                    warn!("Peer {} requested piece {} out of range", addr, index);
                }
            }
            Message::Cancel { index, begin, .. } => {
                if let Some(blocks) = self.requests.get_mut(index) {
                    blocks.remove(begin);
                    if blocks.is_empty() {
                        self.requests.remove(index);
                    }
                }
            }
            Message::Piece { index, begin, .. } => {
                debug!("Discarding unsolicited block {}@{} from {}", index, begin, addr);
            }
        }
    }
}

struct Swarm {
    info_hash: [u8; 20],
    piece_count: usize,
    slots: HashMap<KnownPeer, PeerSlot>,
}

impl Swarm {
    fn live(&self) -> impl Iterator<Item = (&KnownPeer, &PeerSlot, &PeerLink)> {
        self.slots
            .iter()
            .filter_map(|(peer, slot)| slot.link.as_ref().map(|link| (peer, slot, link)))
    }

    fn live_slot(&self, peer: &KnownPeer) -> Result<(&PeerSlot, PeerLink)> {
        match self.slots.get(peer) {
            Some(slot) => match &slot.link {
                Some(link) if !link.is_closed() => Ok((slot, link.clone())),
                _ => Err(TorrentError::invalid_argument_with_field("Peer is not connected", peer.to_string()).into()),
            },
            None => Err(TorrentError::invalid_argument_with_field("Peer is not connected", peer.to_string()).into()),
        }
    }
}

fn is_protocol_format(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TorrentError>().is_some_and(TorrentError::is_protocol_format)
}

fn is_choked(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::PeerChokedError { .. }))
}

/// Manages all peer connections of all torrents
#[derive(Clone)]
pub struct PeerManager {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    peer_id: [u8; 20],
    swarms: Arc<KeyedRegistry<Mutex<Swarm>>>,
    last_keep_alive: Arc<Mutex<Instant>>,
}

impl PeerManager {
    /// Create a new peer manager
    pub fn new(config: Arc<ClientConfig>, transport: Arc<dyn Transport>, peer_id: [u8; 20]) -> Self {
        Self {
            config,
            transport,
            peer_id,
            swarms: Arc::new(KeyedRegistry::new()),
            last_keep_alive: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Bind the inbound listener through the transport
    pub async fn listen(&self, port: u16) -> Result<Box<dyn Listener>> {
        self.transport.listen(port).await
    }

    fn wire(&self) -> BitTorrentWire {
        BitTorrentWire::new(self.config.max_frame_length)
    }

    /// Make sure connection state exists for a torrent
    pub async fn ensure_torrent(&self, infohash: &str, info_hash: [u8; 20], piece_count: usize) {
        self.swarms
            .get_or_insert_with(infohash, || {
                Mutex::new(Swarm {
                    info_hash,
                    piece_count,
                    slots: HashMap::new(),
                })
            })
            .await;
    }

    /// Drop a torrent's connection state, closing its streams
    pub async fn remove_torrent(&self, infohash: &str) {
        if let Some(swarm) = self.swarms.remove(infohash).await {
            let links: Vec<PeerLink> = swarm.lock().await.slots.drain().filter_map(|(_, s)| s.link).collect();
            for link in links {
                link.close().await;
            }
            debug!("Removed connection state of {}", infohash);
        }
    }

    /// Close every connection of every torrent
    pub async fn close_all(&self) {
        for swarm in self.swarms.values().await {
            let links: Vec<PeerLink> = swarm.lock().await.slots.drain().filter_map(|(_, s)| s.link).collect();
            for link in links {
                link.close().await;
            }
        }
    }

    /// Infohashes with connection state
    pub async fn torrents(&self) -> Vec<String> {
        self.swarms.keys().await
    }

    async fn swarm(&self, infohash: &str) -> Result<Arc<Mutex<Swarm>>> {
        self.swarms
            .get(infohash)
            .await
            .ok_or_else(|| TorrentError::invalid_argument_with_field("Torrent is not loaded", infohash).into())
    }

    async fn with_slot<R>(
        &self,
        infohash: &str,
        peer: &KnownPeer,
        link: &PeerLink,
        f: impl FnOnce(&mut PeerSlot, usize) -> R,
    ) -> Option<R> {
        let swarm = self.swarms.get(infohash).await?;
        let mut swarm = swarm.lock().await;
        let piece_count = swarm.piece_count;
        let slot = swarm.slots.get_mut(peer).filter(|slot| slot.live_link(link))?;
        Some(f(slot, piece_count))
    }

    async fn apply_message(&self, infohash: &str, peer: &KnownPeer, link: &PeerLink, message: &Message) {
        self.with_slot(infohash, peer, link, |slot, piece_count| slot.apply(message, piece_count)).await;
    }

    /// Keep the slot but forget its stream
    async fn demote(&self, infohash: &str, peer: &KnownPeer, link: &PeerLink) {
        self.with_slot(infohash, peer, link, |slot, _| slot.link = None).await;
        link.close().await;
        warn!("Connection to {} dropped", peer);
    }

    /// Remove the slot altogether
    async fn teardown(&self, infohash: &str, peer: &KnownPeer, link: &PeerLink) {
        if let Some(swarm) = self.swarms.get(infohash).await {
            let mut swarm = swarm.lock().await;
            if swarm.slots.get(peer).is_some_and(|slot| slot.live_link(link)) {
                swarm.slots.remove(peer);
            }
        }
        link.close().await;
        warn!("Connection to {} torn down", peer);
    }

    async fn register(&self, infohash: &str, peer: KnownPeer, link: Option<PeerLink>) -> Result<()> {
        let swarm = self.swarm(infohash).await?;
        let previous = swarm.lock().await.slots.insert(peer.clone(), PeerSlot::new(peer, link));
        if let Some(old) = previous.and_then(|slot| slot.link) {
            old.close().await;
        }
        Ok(())
    }

    /// Connect to a known peer and exchange handshakes
    ///
    /// Returns the remote peer id, or `None` when the peer answered for a
    /// different torrent; that peer is kept as a dead slot and no error is
    /// raised.
    pub async fn connect(&self, infohash: &str, peer: &KnownPeer, have: &[bool]) -> Result<Option<String>> {
        let info_hash = {
            let swarm = self.swarm(infohash).await?;
            let swarm = swarm.lock().await;
            if let Ok((slot, _)) = swarm.live_slot(peer) {
                debug!("Already connected to {}", peer);
                return Ok(slot.peer.peer.peer_id.clone());
            }
            swarm.info_hash
        };
        let addr = peer.socket_addr()?;

        info!("Connecting to peer: {}", peer);
        let stream = self.transport.connect(addr, self.config.connect_timeout).await?;
        let mut conn = PeerConnection::new(stream, peer.clone(), self.wire());

        conn.send_handshake(&Handshake::new(info_hash, self.peer_id)).await?;
        let theirs = conn.receive_handshake(self.config.connect_timeout).await?;
        if !theirs.validate(&info_hash) {
            conn.shutdown().await;
            self.register(infohash, peer.clone(), None).await?;
            return Ok(None);
        }

        if have.iter().any(|&held| held) {
            conn.send_message(&Message::Bitfield { bitfield: bitfield_from_pieces(have) }).await?;
        }

        let peer_id = theirs.peer_id_string();
        let known = KnownPeer::with_peer_id(peer.ip.clone(), peer.port, peer_id.clone());
        conn.peer = known.clone();
        self.register(infohash, known, Some(PeerLink::new(conn))).await?;
        info!("Connected to peer {} ({})", peer, peer_id);
        Ok(Some(peer_id))
    }

    /// Read the handshake of an inbound stream
    pub async fn accept_handshake(&self, stream: BoxedStream, addr: SocketAddr) -> Result<(PeerConnection, Handshake)> {
        let mut conn = PeerConnection::new(stream, KnownPeer::from_addr(addr), self.wire());
        let theirs = conn.receive_handshake(self.config.connect_timeout).await?;
        debug!("Inbound handshake from {} for {}", addr, hex::encode(theirs.info_hash));
        Ok((conn, theirs))
    }

    /// Answer an inbound handshake and register the connection
    pub async fn complete_inbound(
        &self,
        infohash: &str,
        mut conn: PeerConnection,
        theirs: &Handshake,
        have: &[bool],
    ) -> Result<KnownPeer> {
        let info_hash = self.swarm(infohash).await?.lock().await.info_hash;
        conn.send_handshake(&Handshake::new(info_hash, self.peer_id)).await?;
        if have.iter().any(|&held| held) {
            conn.send_message(&Message::Bitfield { bitfield: bitfield_from_pieces(have) }).await?;
        }

        let known = KnownPeer::with_peer_id(conn.peer.ip.clone(), conn.peer.port, theirs.peer_id_string());
        conn.peer = known.clone();
        self.register(infohash, known.clone(), Some(PeerLink::new(conn))).await?;
        info!("Accepted peer {} for {}", known, infohash);
        Ok(known)
    }

    /// Close the connection to `peer` without a farewell message
    pub async fn disconnect(&self, infohash: &str, peer: &KnownPeer) -> Result<()> {
        let removed = match self.swarms.get(infohash).await {
            Some(swarm) => swarm.lock().await.slots.remove(peer),
            None => None,
        };
        match removed {
            Some(slot) => {
                if let Some(link) = slot.link {
                    link.close().await;
                }
                info!("Disconnected from peer {}", peer);
                Ok(())
            }
            None => {
                error!("Cannot disconnect {}: not connected", peer);
                Err(TorrentError::invalid_argument_with_field("Peer is not connected", peer.to_string()).into())
            }
        }
    }

    /// Live connections, sorted by peer
    pub async fn connected_peers(&self, infohash: &str) -> Vec<ConnectedPeer> {
        let Some(swarm) = self.swarms.get(infohash).await else {
            return Vec::new();
        };
        let swarm = swarm.lock().await;
        let mut peers: Vec<ConnectedPeer> = swarm.live().map(|(_, slot, _)| slot.peer.clone()).collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    /// Send `choke` or `unchoke` and record our new choking state
    pub async fn set_choking(&self, infohash: &str, peer: &KnownPeer, choking: bool) -> Result<()> {
        let link = {
            let swarm = self.swarm(infohash).await?;
            let swarm = swarm.lock().await;
            swarm.live_slot(peer)?.1
        };

        let message = if choking { Message::Choke } else { Message::Unchoke };
        let sent = link.conn.lock().await.send_message(&message).await;
        if let Err(e) = sent {
            self.demote(infohash, peer, &link).await;
            return Err(e);
        }

        self.with_slot(infohash, peer, &link, |slot, _| {
            slot.peer.am_choking = choking;
            // A choked peer's outstanding requests are void
            if choking {
                slot.requests.clear();
            }
        })
        .await;
        debug!("{} peer {}", if choking { "Choked" } else { "Unchoked" }, peer);
        Ok(())
    }

    /// Download `piece` from `peer` block by block and verify it
    ///
    /// Returns the verified piece data. Chunks already received are
    /// discarded when the transfer fails.
    pub async fn request_piece(&self, infohash: &str, peer: &KnownPeer, piece: &Piece) -> Result<Vec<u8>> {
        let link = {
            let swarm = self.swarm(infohash).await?;
            let swarm = swarm.lock().await;
            let (slot, link) = swarm.live_slot(peer)?;
            if !slot.bitmap.has_piece(piece.index as usize) {
                error!("Peer {} does not have piece {}", peer, piece.index);
                return Err(TorrentError::invalid_argument_with_field(
                    format!("Peer does not have piece {}", piece.index),
                    peer.to_string(),
                )
                .into());
            }
            if slot.peer.peer_choking {
                return Err(TorrentError::peer_choked(peer.to_string(), Some(piece.index)).into());
            }
            link
        };

        let mut conn = link.conn.lock().await;
        let result = self.download_blocks(infohash, peer, &link, &mut conn, piece).await;
        drop(conn);

        let data = match result {
            Ok(data) => data,
            Err(e) if is_choked(&e) => {
                warn!("Peer {} choked us during piece {}", peer, piece.index);
                return Err(e);
            }
            Err(e) => {
                error!("Piece {} from {} failed: {}", piece.index, peer, e);
                self.teardown(infohash, peer, &link).await;
                return Err(TorrentError::peer_connect_full("Piece transfer failed", peer.to_string(), e.to_string()).into());
            }
        };

        if !piece.verify(&data) {
            warn!("Piece {} from {} failed hash check", piece.index, peer);
            return Err(TorrentError::piece_hash(piece.index).into());
        }
        info!("Downloaded piece {} from {}", piece.index, peer);
        Ok(data)
    }

    async fn download_blocks(
        &self,
        infohash: &str,
        peer: &KnownPeer,
        link: &PeerLink,
        conn: &mut PeerConnection,
        piece: &Piece,
    ) -> Result<Vec<u8>> {
        let length = piece.length as usize;
        let block_size = self.config.block_size as usize;
        let mut buffer = vec![0u8; length];

        let mut begin = 0usize;
        while begin < length {
            let chunk = block_size.min(length - begin);

            let still_unchoked = self
                .with_slot(infohash, peer, link, |slot, _| !slot.peer.peer_choking)
                .await
                .ok_or_else(|| TorrentError::peer_connect_with_peer("Connection closed", peer.to_string()))?;
            if !still_unchoked {
                return Err(TorrentError::peer_choked(peer.to_string(), Some(piece.index)).into());
            }

            trace!("Requesting block {}@{} ({} bytes) from {}", piece.index, begin, chunk, peer);
            conn.send_message(&Message::Request {
                index: piece.index,
                begin: begin as u32,
                length: chunk as u32,
            })
            .await?;

            let deadline = Instant::now() + self.config.piece_timeout;
            loop {
                if link.is_closed() {
                    return Err(TorrentError::peer_connect_with_peer("Connection closed", peer.to_string()).into());
                }
                if Instant::now() >= deadline {
                    return Err(TorrentError::peer_connect_with_peer("Timed out waiting for block", peer.to_string()).into());
                }

                match conn.receive_message(self.config.read_timeout).await {
                    Ok(None) => continue,
                    Ok(Some(Message::Piece { index, begin: offset, block }))
                        if index == piece.index && offset as usize == begin =>
                    {
                        if block.len() != chunk {
                            return Err(TorrentError::protocol_error_with_source(
                                "Block has wrong length",
                                format!("expected {}, got {}", chunk, block.len()),
                            )
                            .into());
                        }
                        buffer[begin..begin + chunk].copy_from_slice(&block);
                        break;
                    }
                    Ok(Some(message)) => {
                        self.apply_message(infohash, peer, link, &message).await;
                        if message == Message::Choke {
                            return Err(TorrentError::peer_choked(peer.to_string(), Some(piece.index)).into());
                        }
                    }
                    Err(e) if is_protocol_format(&e) => {
                        warn!("Skipping malformed message from {}: {}", peer, e);
                    }
                    Err(e) => return Err(e),
                }
            }
            begin += chunk;
        }
        Ok(buffer)
    }

    /// Serve every pending request `peer` has for `piece`
    ///
    /// Keeps serving while new requests for the piece arrive within the
    /// send window. Returns the number of bytes uploaded. A broken stream
    /// ends the transfer quietly and leaves a dead slot behind.
    pub async fn send_piece(&self, infohash: &str, peer: &KnownPeer, piece: &Piece) -> Result<u64> {
        let link = {
            let swarm = self.swarm(infohash).await?;
            let swarm = swarm.lock().await;
            let (slot, link) = swarm.live_slot(peer)?;
            if slot.requests.get(&piece.index).map_or(true, BTreeMap::is_empty) {
                error!("Peer {} has no pending requests for piece {}", peer, piece.index);
                return Err(TorrentError::invalid_argument_with_field(
                    format!("No pending requests for piece {}", piece.index),
                    peer.to_string(),
                )
                .into());
            }
            link
        };
        let data = piece.data.as_deref().ok_or_else(|| {
            TorrentError::invalid_argument_with_field(format!("Piece {} is not downloaded", piece.index), "piece_index")
        })?;

        let mut conn = link.conn.lock().await;
        let mut uploaded = 0u64;
        loop {
            let pending = self
                .with_slot(infohash, peer, &link, |slot, _| slot.requests.remove(&piece.index))
                .await
                .flatten()
                .unwrap_or_default();
            if pending.is_empty() {
                break;
            }

            for (begin, length) in pending {
                let start = begin as usize;
                let Some(block) = start.checked_add(length as usize).and_then(|end| data.get(start..end)) else {
                    warn!("Dropping out-of-range request {}@{}+{} from {}", piece.index, begin, length, peer);
                    continue;
                };
                let message = Message::Piece {
                    index: piece.index,
                    begin,
                    block: block.to_vec(),
                };
                if let Err(e) = conn.send_message(&message).await {
                    warn!("Sending piece {} to {} failed: {}", piece.index, peer, e);
                    drop(conn);
                    self.demote(infohash, peer, &link).await;
                    return Ok(uploaded);
                }
                uploaded += u64::from(length);
            }

            let deadline = Instant::now() + self.config.send_piece_window;
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) {
                match conn.receive_message(remaining).await {
                    Ok(None) => {}
                    Ok(Some(message)) => self.apply_message(infohash, peer, &link, &message).await,
                    Err(e) if is_protocol_format(&e) => warn!("Skipping malformed message from {}: {}", peer, e),
                    Err(e) => {
                        warn!("Connection to {} failed while serving: {}", peer, e);
                        drop(conn);
                        self.demote(infohash, peer, &link).await;
                        return Ok(uploaded);
                    }
                }
            }
        }

        info!("Uploaded {} bytes of piece {} to {}", uploaded, piece.index, peer);
        Ok(uploaded)
    }

    /// Pieces each unchoking peer can give us right now
    ///
    /// At most `per_peer` indices per peer, walking cyclically from
    /// `start_index`. Peers with nothing to offer are left out.
    pub async fn available_pieces(
        &self,
        infohash: &str,
        have: &[bool],
        per_peer: usize,
        start_index: usize,
    ) -> BTreeMap<KnownPeer, Vec<u32>> {
        let mut available = BTreeMap::new();
        let count = have.len();
        if count == 0 || per_peer == 0 {
            return available;
        }
        let Some(swarm) = self.swarms.get(infohash).await else {
            return available;
        };
        let swarm = swarm.lock().await;

        let start = start_index % count;
        for (peer, slot, _) in swarm.live().filter(|(_, slot, _)| !slot.peer.peer_choking) {
            let pieces: Vec<u32> = (0..count)
                .map(|offset| (start + offset) % count)
                .filter(|&i| !have[i] && slot.bitmap.has_piece(i))
                .take(per_peer)
                .map(|i| i as u32)
                .collect();
            if !pieces.is_empty() {
                available.insert(peer.clone(), pieces);
            }
        }
        available
    }

    /// Pieces each connected peer has outstanding requests for
    pub async fn requested_pieces(&self, infohash: &str) -> BTreeMap<KnownPeer, Vec<u32>> {
        let Some(swarm) = self.swarms.get(infohash).await else {
            return BTreeMap::new();
        };
        let swarm = swarm.lock().await;
        swarm
            .live()
            .filter(|(_, slot, _)| !slot.requests.is_empty())
            .map(|(peer, slot, _)| (peer.clone(), slot.requests.keys().copied().collect()))
            .collect()
    }

    /// Tell every other live peer that we now have `piece_index`
    pub async fn broadcast_have(&self, infohash: &str, piece_index: u32, except: &KnownPeer) {
        let links: Vec<(KnownPeer, PeerLink)> = match self.swarms.get(infohash).await {
            Some(swarm) => swarm
                .lock()
                .await
                .live()
                .filter(|(peer, _, _)| *peer != except)
                .map(|(peer, _, link)| (peer.clone(), link.clone()))
                .collect(),
            None => return,
        };

        for (peer, link) in links {
            let Ok(mut conn) = timeout(self.config.read_timeout, link.conn.lock()).await else {
                debug!("Peer {} busy, skipping have {}", peer, piece_index);
                continue;
            };
            if conn.send_message(&Message::Have { piece_index }).await.is_err() {
                drop(conn);
                self.demote(infohash, &peer, &link).await;
            }
        }
    }

    /// Whether the global keep-alive timer expired; restarts it if so
    pub async fn keep_alive_due(&self) -> bool {
        let mut last = self.last_keep_alive.lock().await;
        if last.elapsed() >= self.config.keep_alive_interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// One pump tick over every live connection of a torrent
    ///
    /// Connections busy with a transfer are skipped this tick.
    pub async fn pump(&self, infohash: &str, have: Arc<Vec<bool>>, keep_alive: bool) {
        let links: Vec<(KnownPeer, PeerLink)> = match self.swarms.get(infohash).await {
            Some(swarm) => swarm
                .lock()
                .await
                .live()
                .map(|(peer, _, link)| (peer.clone(), link.clone()))
                .collect(),
            None => return,
        };

        let mut tasks = JoinSet::new();
        for (peer, link) in links {
            let manager = self.clone();
            let infohash = infohash.to_string();
            let have = have.clone();
            tasks.spawn(async move { manager.pump_peer(&infohash, &peer, &link, &have, keep_alive).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Pump task failed: {}", e);
            }
        }
    }

    async fn pump_peer(&self, infohash: &str, peer: &KnownPeer, link: &PeerLink, have: &[bool], keep_alive: bool) {
        let Ok(mut conn) = link.conn.try_lock() else {
            trace!("Peer {} busy, skipping pump tick", peer);
            return;
        };
        if link.is_closed() {
            return;
        }

        let mut tick = self.config.read_timeout;
        for _ in 0..MAX_MESSAGES_PER_TICK {
            match conn.receive_message(tick).await {
                Ok(None) => break,
                Ok(Some(message)) => self.apply_message(infohash, peer, link, &message).await,
                Err(e) if is_protocol_format(&e) => warn!("Skipping malformed message from {}: {}", peer, e),
                Err(e) => {
                    warn!("Connection to {} failed: {}", peer, e);
                    drop(conn);
                    self.demote(infohash, peer, link).await;
                    return;
                }
            }
            // Only drain what is already buffered after the first message
            tick = Duration::ZERO;
        }

        let change = self
            .with_slot(infohash, peer, link, |slot, _| {
                let wanted = have.iter().enumerate().any(|(i, &held)| !held && slot.bitmap.has_piece(i));
                (wanted != slot.peer.am_interested).then_some(wanted)
            })
            .await
            .flatten();

        let mut outgoing = Vec::new();
        if let Some(interested) = change {
            outgoing.push(if interested { Message::Interested } else { Message::NotInterested });
        }
        if keep_alive {
            outgoing.push(Message::KeepAlive);
        }
        for message in outgoing {
            if let Err(e) = conn.send_message(&message).await {
                warn!("Connection to {} failed: {}", peer, e);
                drop(conn);
                self.demote(infohash, peer, link).await;
                return;
            }
        }

        if let Some(interested) = change {
            self.with_slot(infohash, peer, link, |slot, _| slot.peer.am_interested = interested).await;
            debug!("{} in peer {}", if interested { "Interested" } else { "Not interested" }, peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::TcpTransport;
    use crate::torrent::info::generate_info_hash;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const INFOHASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const INFO_HASH: [u8; 20] = [0xaa; 20];

    fn manager() -> PeerManager {
        let config = ClientConfig {
            piece_timeout: Duration::from_secs(2),
            block_size: 4,
            max_frame_length: 64,
            ..ClientConfig::default()
        };
        PeerManager::new(Arc::new(config), Arc::new(TcpTransport), *b"-CS1000-000000abcdef")
    }

    async fn read_frame(socket: &mut TcpStream) -> Message {
        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        socket.read_exact(&mut body).await.unwrap();
        Message::from_frame(&body).unwrap()
    }

    /// Accepts one connection, answers the handshake with `answer_hash`
    async fn remote_peer(answer_hash: [u8; 20]) -> (KnownPeer, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = [0u8; 68];
            socket.read_exact(&mut raw).await.unwrap();
            socket.write_all(&Handshake::new(answer_hash, *b"-RP0001-remotepeer01").serialize()).await.unwrap();
            socket
        });
        (KnownPeer::new("127.0.0.1", port), handle)
    }

    #[tokio::test]
    async fn test_connect_registers_choked_peer() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 3).await;
        let (peer, remote) = remote_peer(INFO_HASH).await;

        let peer_id = manager.connect(INFOHASH, &peer, &[false, true, false]).await.unwrap();
        assert_eq!(peer_id.as_deref(), Some("-RP0001-remotepeer01"));

        let mut socket = remote.await.unwrap();
        assert_eq!(read_frame(&mut socket).await, Message::Bitfield { bitfield: vec![0b0100_0000] });

        let connected = manager.connected_peers(INFOHASH).await;
        assert_eq!(connected.len(), 1);
        assert!(connected[0].am_choking && connected[0].peer_choking);
        assert_eq!(connected[0].peer.peer_id.as_deref(), Some("-RP0001-remotepeer01"));
    }

    #[tokio::test]
    async fn test_handshake_mismatch_keeps_dead_slot() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 3).await;
        let (peer, _remote) = remote_peer([0xbb; 20]).await;

        assert_eq!(manager.connect(INFOHASH, &peer, &[false; 3]).await.unwrap(), None);
        assert!(manager.connected_peers(INFOHASH).await.is_empty());

        // The dead slot can be disconnected once
        manager.disconnect(INFOHASH, &peer).await.unwrap();
        assert!(manager.disconnect(INFOHASH, &peer).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_peer_connect_error() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 3).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = KnownPeer::from_addr(listener.local_addr().unwrap());
        drop(listener);

        let err = manager.connect(INFOHASH, &peer, &[false; 3]).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::PeerConnectError { .. })));
    }

    #[tokio::test]
    async fn test_pump_tracks_remote_state_and_interest() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 3).await;
        let (peer, remote) = remote_peer(INFO_HASH).await;
        manager.connect(INFOHASH, &peer, &[false; 3]).await.unwrap();
        let mut socket = remote.await.unwrap();

        socket.write_all(&Message::Bitfield { bitfield: vec![0b0100_0000] }.serialize()).await.unwrap();
        socket.write_all(&Message::Have { piece_index: 2 }.serialize()).await.unwrap();
        socket.write_all(&Message::Unchoke.serialize()).await.unwrap();
        socket.write_all(&Message::Interested.serialize()).await.unwrap();
        // Choked by us, so this request is ignored
        socket.write_all(&Message::Request { index: 1, begin: 0, length: 4 }.serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.pump(INFOHASH, Arc::new(vec![false; 3]), false).await;

        let connected = manager.connected_peers(INFOHASH).await;
        assert!(!connected[0].peer_choking);
        assert!(connected[0].peer_interested);
        assert!(connected[0].am_interested);
        assert!(manager.requested_pieces(INFOHASH).await.is_empty());
        assert_eq!(read_frame(&mut socket).await, Message::Interested);

        let available = manager.available_pieces(INFOHASH, &[false; 3], 2, 0).await;
        assert_eq!(available.get(&peer), Some(&vec![1, 2]));
        let available = manager.available_pieces(INFOHASH, &[false; 3], 1, 2).await;
        assert_eq!(available.get(&peer), Some(&vec![2]));
        let available = manager.available_pieces(INFOHASH, &[false, true, true], 2, 0).await;
        assert!(available.is_empty());
    }

    #[tokio::test]
    async fn test_request_piece_assembles_blocks() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 1).await;
        let (peer, remote) = remote_peer(INFO_HASH).await;
        manager.connect(INFOHASH, &peer, &[false]).await.unwrap();
        let mut socket = remote.await.unwrap();

        let content = b"0123456789".to_vec();
        let piece = Piece {
            index: 0,
            length: content.len() as u32,
            hash: generate_info_hash(&content).to_vec(),
            data: None,
        };

        socket.write_all(&Message::Bitfield { bitfield: vec![0b1000_0000] }.serialize()).await.unwrap();
        socket.write_all(&Message::Unchoke.serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.pump(INFOHASH, Arc::new(vec![false]), false).await;
        assert_eq!(read_frame(&mut socket).await, Message::Interested);

        let served = content.clone();
        let seeder = tokio::spawn(async move {
            for _ in 0..3 {
                match read_frame(&mut socket).await {
                    Message::Request { index, begin, length } => {
                        let block = served[begin as usize..(begin + length) as usize].to_vec();
                        socket.write_all(&Message::Piece { index, begin, block }.serialize()).await.unwrap();
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            socket
        });

        let data = manager.request_piece(INFOHASH, &peer, &piece).await.unwrap();
        assert_eq!(data, content);
        seeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_piece_while_choked() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 1).await;
        let (peer, remote) = remote_peer(INFO_HASH).await;
        manager.connect(INFOHASH, &peer, &[false]).await.unwrap();
        let mut socket = remote.await.unwrap();
        socket.write_all(&Message::Have { piece_index: 0 }.serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.pump(INFOHASH, Arc::new(vec![false]), false).await;

        let piece = Piece { index: 0, length: 4, hash: vec![0; 20], data: None };
        let err = manager.request_piece(INFOHASH, &peer, &piece).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::PeerChokedError { .. })));
    }

    #[tokio::test]
    async fn test_send_piece_serves_requests() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 1).await;
        let (peer, remote) = remote_peer(INFO_HASH).await;
        manager.connect(INFOHASH, &peer, &[true]).await.unwrap();
        let mut socket = remote.await.unwrap();
        assert_eq!(read_frame(&mut socket).await, Message::Bitfield { bitfield: vec![0b1000_0000] });

        manager.set_choking(INFOHASH, &peer, false).await.unwrap();
        assert_eq!(read_frame(&mut socket).await, Message::Unchoke);

        socket.write_all(&Message::Request { index: 0, begin: 0, length: 4 }.serialize()).await.unwrap();
        socket.write_all(&Message::Request { index: 0, begin: 4, length: 2 }.serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.pump(INFOHASH, Arc::new(vec![true]), false).await;
        assert_eq!(manager.requested_pieces(INFOHASH).await.get(&peer), Some(&vec![0]));

        let piece = Piece { index: 0, length: 6, hash: vec![0; 20], data: Some(b"abcdef".to_vec()) };
        let uploaded = manager.send_piece(INFOHASH, &peer, &piece).await.unwrap();
        assert_eq!(uploaded, 6);
        assert_eq!(read_frame(&mut socket).await, Message::Piece { index: 0, begin: 0, block: b"abcd".to_vec() });
        assert_eq!(read_frame(&mut socket).await, Message::Piece { index: 0, begin: 4, block: b"ef".to_vec() });
        assert!(manager.requested_pieces(INFOHASH).await.is_empty());

        let err = manager.send_piece(INFOHASH, &peer, &piece).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::InvalidArgument { .. })));
    }

    /// Connects to a remote peer that holds every piece and has unchoked us
    async fn unchoked_seeder(manager: &PeerManager, piece_count: usize) -> (KnownPeer, TcpStream) {
        manager.ensure_torrent(INFOHASH, INFO_HASH, piece_count).await;
        let (peer, remote) = remote_peer(INFO_HASH).await;
        manager.connect(INFOHASH, &peer, &vec![false; piece_count]).await.unwrap();
        let mut socket = remote.await.unwrap();

        socket.write_all(&Message::Bitfield { bitfield: vec![0xff] }.serialize()).await.unwrap();
        socket.write_all(&Message::Unchoke.serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.pump(INFOHASH, Arc::new(vec![false; piece_count]), false).await;
        assert_eq!(read_frame(&mut socket).await, Message::Interested);
        (peer, socket)
    }

    #[tokio::test]
    async fn test_available_pieces_wraps_any_start_index() {
        let manager = manager();
        let (peer, _socket) = unchoked_seeder(&manager, 3).await;
        let have = [true, false, false];

        let available = manager.available_pieces(INFOHASH, &have, 2, 5).await;
        assert_eq!(available.get(&peer), Some(&vec![2, 1]));
        let available = manager.available_pieces(INFOHASH, &have, 2, 3).await;
        assert_eq!(available.get(&peer), Some(&vec![1, 2]));
        // usize::MAX is a multiple of 3
        let available = manager.available_pieces(INFOHASH, &have, 2, usize::MAX).await;
        assert_eq!(available.get(&peer), Some(&vec![1, 2]));
    }

    #[tokio::test]
    async fn test_choke_during_transfer_keeps_connection() {
        let manager = manager();
        let (peer, mut socket) = unchoked_seeder(&manager, 1).await;
        let piece = Piece { index: 0, length: 10, hash: vec![0; 20], data: None };

        let seeder = tokio::spawn(async move {
            match read_frame(&mut socket).await {
                Message::Request { index, begin, length } => {
                    let block = vec![7u8; length as usize];
                    socket.write_all(&Message::Piece { index, begin, block }.serialize()).await.unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(matches!(read_frame(&mut socket).await, Message::Request { begin: 4, .. }));
            socket.write_all(&Message::Choke.serialize()).await.unwrap();
            socket
        });

        let err = manager.request_piece(INFOHASH, &peer, &piece).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::PeerChokedError { piece: Some(0), .. })
        ));
        let _socket = seeder.await.unwrap();

        let connected = manager.connected_peers(INFOHASH).await;
        assert_eq!(connected.len(), 1);
        assert!(connected[0].peer_choking);
    }

    #[tokio::test]
    async fn test_disconnect_during_transfer_fails_request() {
        let manager = manager();
        let (peer, mut socket) = unchoked_seeder(&manager, 1).await;
        let piece = Piece { index: 0, length: 4, hash: vec![0; 20], data: None };

        let started = Instant::now();
        let requester = manager.clone();
        let request = {
            let peer = peer.clone();
            tokio::spawn(async move { requester.request_piece(INFOHASH, &peer, &piece).await })
        };

        // The request is in flight once its first block request arrives
        assert!(matches!(read_frame(&mut socket).await, Message::Request { index: 0, .. }));
        manager.disconnect(INFOHASH, &peer).await.unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::PeerConnectError { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(manager.connected_peers(INFOHASH).await.is_empty());
    }

    #[tokio::test]
    async fn test_pump_demotes_closed_connection() {
        let manager = manager();
        manager.ensure_torrent(INFOHASH, INFO_HASH, 1).await;
        let (peer, remote) = remote_peer(INFO_HASH).await;
        manager.connect(INFOHASH, &peer, &[false]).await.unwrap();
        drop(remote.await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.pump(INFOHASH, Arc::new(vec![false]), false).await;
        assert!(manager.connected_peers(INFOHASH).await.is_empty());
        let err = manager.set_choking(INFOHASH, &peer, true).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::InvalidArgument { .. })));
    }
}
