use super::*;
use crate::bencode;
use crate::peer::TcpTransport;
use crate::protocol::{Handshake, Message};
use crate::storage::MemoryStore;
use crate::torrent::info::generate_info_hash;
use crate::torrent::parser::tests::single_file_torrent;
use crate::tracker::client::tests::ScriptedHttp;
use crate::tracker::CONNECTION_FAILED;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MOCK_PEER_ID: &[u8; 20] = b"-MK0001-mockpeer0001";
const REFUSED: &[u8] = b"d14:failure reason7:go awaye";

fn client(http: Arc<ScriptedHttp>) -> (TorrentClient, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let config = ClientConfig {
        listen_port: 0,
        ..ClientConfig::default()
    };
    (TorrentClient::new(config, store.clone(), http, Arc::new(TcpTransport)), store)
}

fn peers_reply(peers: &[(Ipv4Addr, u16)]) -> Vec<u8> {
    let mut compact = Vec::new();
    for (ip, port) in peers {
        compact.extend_from_slice(&ip.octets());
        compact.extend_from_slice(&port.to_be_bytes());
    }
    let mut body = format!("d8:intervali60e5:peers{}:", compact.len()).into_bytes();
    body.extend_from_slice(&compact);
    body.push(b'e');
    body
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

async fn read_frame(socket: &mut TcpStream) -> Option<Message> {
    let mut len = [0u8; 4];
    socket.read_exact(&mut len).await.ok()?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    socket.read_exact(&mut body).await.ok()?;
    Message::from_frame(&body).ok()
}

async fn answer_handshake(listener: TcpListener, info_hash: [u8; 20]) -> TcpStream {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut raw = [0u8; 68];
    socket.read_exact(&mut raw).await.unwrap();
    socket.write_all(&Handshake::new(info_hash, *MOCK_PEER_ID).serialize()).await.unwrap();
    socket
}

/// Peer that advertises `bitfield`, unchokes and serves every request
///
/// With `corrupt_first` the first block served has flipped bits.
async fn spawn_seeder(
    info_hash: [u8; 20],
    bitfield: Vec<u8>,
    data: Vec<u8>,
    piece_length: usize,
    corrupt_first: bool,
) -> (KnownPeer, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = KnownPeer::from_addr(listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let mut socket = answer_handshake(listener, info_hash).await;
        socket.write_all(&Message::Bitfield { bitfield }.serialize()).await.unwrap();
        socket.write_all(&Message::Unchoke.serialize()).await.unwrap();

        let mut corrupt = corrupt_first;
        while let Some(message) = read_frame(&mut socket).await {
            if let Message::Request { index, begin, length } = message {
                let start = index as usize * piece_length + begin as usize;
                let mut block = data[start..start + length as usize].to_vec();
                if corrupt {
                    block.iter_mut().for_each(|b| *b = !*b);
                    corrupt = false;
                }
                let reply = Message::Piece { index, begin, block };
                if socket.write_all(&reply.serialize()).await.is_err() {
                    break;
                }
            }
        }
    });
    (peer, handle)
}

/// Load a torrent whose only tracker hands out `peers`
async fn load_with_peers(
    client: &TorrentClient,
    http: &ScriptedHttp,
    data: &[u8],
    piece_length: usize,
    peers: &[(Ipv4Addr, u16)],
) -> String {
    http.reply("http://tracker.test/announce", &peers_reply(peers));
    let infohash = client.load(&single_file_torrent(data, piece_length, None)).await.unwrap();
    client
        .announce(&infohash, TrackerEvent::Started, 0, 0, data.len() as u64)
        .await
        .unwrap();
    infohash
}

fn kind(err: &anyhow::Error) -> &TorrentError {
    err.downcast_ref::<TorrentError>().unwrap()
}

#[tokio::test]
async fn test_load_computes_infohash_once() {
    let (client, _) = client(Arc::new(ScriptedHttp::default()));
    let torrent = single_file_torrent(b"hello world", 4, None);
    let info = bencode::dict_value_span(&torrent, b"info").unwrap().unwrap();

    let infohash = client.load(&torrent).await.unwrap();
    assert_eq!(infohash, hex::encode(generate_info_hash(info)));

    let err = client.load(&torrent).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::AlreadyLoaded { .. }));

    let err = client.load(b"d4:spam").await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidTorrentFormat { .. }));
}

#[tokio::test]
async fn test_unload_removes_every_record() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, store) = client(http.clone());
    let infohash = load_with_peers(&client, &http, b"abcdef", 4, &[(Ipv4Addr::LOCALHOST, 6881)]).await;
    assert!(!client.tracker_stats(&infohash).await.unwrap().is_empty());

    client.unload(&infohash).await.unwrap();
    assert!(store.is_empty().await);

    let err = client.announces(&infohash).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidArgument { .. }));
    let err = client.unload(&infohash).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidArgument { .. }));
    assert!(client.shared.locks.keys().await.is_empty());
}

#[tokio::test]
async fn test_unknown_infohash_creates_no_lock() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http);
    let unknown = "cd".repeat(20);

    let err = client.announce(&unknown, TrackerEvent::Regular, 0, 0, 0).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidArgument { .. }));
    assert!(client.scrape("not-hex").await.is_err());
    assert!(client.invalidate_peer(&unknown, &KnownPeer::new("10.0.0.1", 1)).await.is_err());
    assert!(client.recheck(&unknown).await.is_err());
    assert!(client.load_files(&unknown, &BTreeMap::new()).await.is_err());
    assert!(client.unload(&unknown).await.is_err());
    assert!(client.shared.locks.keys().await.is_empty());
}

#[tokio::test]
async fn test_announce_failover_and_known_peers_order() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    http.reply("http://one/announce", REFUSED);
    http.reply(
        "http://two/announce",
        &peers_reply(&[(Ipv4Addr::new(127, 0, 0, 100), 6881), (Ipv4Addr::new(127, 0, 0, 2), 6881)]),
    );
    let torrent = single_file_torrent(b"abc", 16, Some(vec![vec!["http://one/announce"], vec!["http://two/announce"]]));
    let infohash = client.load(&torrent).await.unwrap();

    let interval = client.announce(&infohash, TrackerEvent::Started, 0, 0, 3).await.unwrap();
    assert_eq!(interval, 60);
    assert_eq!(
        client.announces(&infohash).await.unwrap(),
        vec![vec!["http://one/announce".to_string()], vec!["http://two/announce".to_string()]]
    );

    let peers = client.known_peers(&infohash).await.unwrap();
    assert_eq!(peers, vec![KnownPeer::new("127.0.0.2", 6881), KnownPeer::new("127.0.0.100", 6881)]);

    // Announcing again does not duplicate peers
    client.announce(&infohash, TrackerEvent::Regular, 0, 0, 3).await.unwrap();
    assert_eq!(client.known_peers(&infohash).await.unwrap().len(), 2);

    let stats = client.tracker_stats(&infohash).await.unwrap();
    assert_eq!(stats["http://one/announce"], ScrapeData::Failure { reason: "go away".to_string() });
    assert!(matches!(stats["http://two/announce"], ScrapeData::Scrape { .. }));
}

#[tokio::test]
async fn test_announce_all_trackers_fail() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    http.reply("http://two/announce", REFUSED);
    let torrent = single_file_torrent(b"abc", 16, Some(vec![vec!["http://one/announce"], vec!["http://two/announce"]]));
    let infohash = client.load(&torrent).await.unwrap();

    let err = client.announce(&infohash, TrackerEvent::Regular, 0, 0, 3).await.unwrap_err();
    match kind(&err) {
        TorrentError::TrackerFailure { reason } => assert_eq!(reason, "go away"),
        other => panic!("unexpected {:?}", other),
    }

    let stats = client.tracker_stats(&infohash).await.unwrap();
    assert_eq!(stats["http://one/announce"], ScrapeData::Failure { reason: CONNECTION_FAILED.to_string() });
}

#[tokio::test]
async fn test_scrape_never_fails_for_one_tracker() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let torrent = single_file_torrent(b"abc", 16, Some(vec![vec!["http://one/announce", "http://two/tracker"]]));
    let infohash = client.load(&torrent).await.unwrap();
    let info_hash = parse_infohash(&infohash).unwrap();

    let mut body = b"d5:filesd20:".to_vec();
    body.extend_from_slice(&info_hash);
    body.extend_from_slice(b"d8:completei3e10:incompletei4eeee");
    http.reply("http://one/scrape", &body);

    client.scrape(&infohash).await.unwrap();
    let stats = client.tracker_stats(&infohash).await.unwrap();
    assert_eq!(
        stats["http://one/announce"],
        ScrapeData::Scrape { seeders: 3, leechers: 4, downloaded: 0, name: None }
    );
    assert_eq!(stats["http://two/tracker"], ScrapeData::Failure { reason: CONNECTION_FAILED.to_string() });
}

#[tokio::test]
async fn test_invalidate_peer_is_idempotent() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let infohash = load_with_peers(&client, &http, b"abc", 16, &[(Ipv4Addr::new(10, 0, 0, 1), 6881)]).await;

    client.invalidate_peer(&infohash, &KnownPeer::new("10.0.0.9", 1)).await.unwrap();
    assert_eq!(client.known_peers(&infohash).await.unwrap().len(), 1);

    client.invalidate_peer(&infohash, &KnownPeer::new("10.0.0.1", 6881)).await.unwrap();
    assert!(client.known_peers(&infohash).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_requires_known_peer() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let infohash = load_with_peers(&client, &http, b"abc", 16, &[]).await;

    let err = client.connect(&infohash, &KnownPeer::new("127.0.0.1", 1)).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidArgument { .. }));
    let err = client.connect("00".repeat(20).as_str(), &KnownPeer::new("127.0.0.1", 1)).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidArgument { .. }));
}

#[tokio::test]
async fn test_request_piece_verifies_hash() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let data = content(100);
    let torrent = single_file_torrent(&data, 64, None);
    let info_hash = generate_info_hash(bencode::dict_value_span(&torrent, b"info").unwrap().unwrap());

    let (peer, seeder) = spawn_seeder(info_hash, vec![0b1100_0000], data.clone(), 64, true).await;
    let infohash = load_with_peers(&client, &http, &data, 64, &[(Ipv4Addr::LOCALHOST, peer.port)]).await;

    client.connect(&infohash, &peer).await.unwrap();
    let known = client.known_peers(&infohash).await.unwrap();
    assert_eq!(known[0].peer_id.as_deref(), Some("-MK0001-mockpeer0001"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.pump().await;
    let connected = client.connected_peers(&infohash).await.unwrap();
    assert!(!connected[0].peer_choking);
    assert!(connected[0].am_interested);

    let err = client.request_piece(&infohash, &peer, 0).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::PieceHashError { piece: 0 }));
    let stats = client.torrent_stats(&infohash).await.unwrap();
    assert_eq!((stats.wasted, stats.have_pieces, stats.left), (64, 0, 100));

    client.request_piece(&infohash, &peer, 0).await.unwrap();
    client.request_piece(&infohash, &peer, 1).await.unwrap();
    let stats = client.torrent_stats(&infohash).await.unwrap();
    assert_eq!((stats.downloaded, stats.have_pieces, stats.left), (100, 2, 0));

    assert_eq!(client.files(&infohash).await.unwrap()["file.bin"], data);
    assert!(client.recheck(&infohash).await.unwrap());

    let err = client.request_piece(&infohash, &peer, 2).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidArgument { .. }));

    client.disconnect(&infohash, &peer).await.unwrap();
    let err = client.disconnect(&infohash, &peer).await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::InvalidArgument { .. }));
    seeder.await.unwrap();
}

#[tokio::test]
async fn test_available_pieces_from_unchoking_peer() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let data = content(48);
    let torrent = single_file_torrent(&data, 16, None);
    let info_hash = generate_info_hash(bencode::dict_value_span(&torrent, b"info").unwrap().unwrap());

    let (peer, _seeder) = spawn_seeder(info_hash, vec![0b0110_0000], data.clone(), 16, false).await;
    let infohash = load_with_peers(&client, &http, &data, 16, &[(Ipv4Addr::LOCALHOST, peer.port)]).await;
    client.connect(&infohash, &peer).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.pump().await;

    let available = client.available_pieces(&infohash, 2, 0).await.unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[&peer], vec![1, 2]);

    let available = client.available_pieces(&infohash, 2, 2).await.unwrap();
    assert_eq!(available[&peer], vec![2, 1]);
}

#[tokio::test]
async fn test_send_piece_serves_pending_requests() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let data = content(32);
    let torrent = single_file_torrent(&data, 16, None);
    let info_hash = generate_info_hash(bencode::dict_value_span(&torrent, b"info").unwrap().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = KnownPeer::from_addr(listener.local_addr().unwrap());
    let leecher = tokio::spawn(async move {
        let mut socket = answer_handshake(listener, info_hash).await;
        let mut received = Vec::new();
        while let Some(message) = read_frame(&mut socket).await {
            match message {
                Message::Unchoke => {
                    for begin in [0, 8] {
                        let request = Message::Request { index: 1, begin, length: 8 };
                        socket.write_all(&request.serialize()).await.unwrap();
                    }
                }
                Message::Piece { begin, block, .. } => received.push((begin, block)),
                _ => {}
            }
        }
        received
    });

    let infohash = load_with_peers(&client, &http, &data, 16, &[(Ipv4Addr::LOCALHOST, peer.port)]).await;
    let mut files = BTreeMap::new();
    files.insert("file.bin".to_string(), data.clone());
    client.load_files(&infohash, &files).await.unwrap();
    assert!(client.recheck(&infohash).await.unwrap());

    client.connect(&infohash, &peer).await.unwrap();
    client.unchoke(&infohash, &peer).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.pump().await;
    assert_eq!(client.requested_pieces(&infohash).await.unwrap()[&peer], vec![1]);

    client.send_piece(&infohash, &peer, 1).await.unwrap();
    assert!(client.requested_pieces(&infohash).await.unwrap().is_empty());
    assert_eq!(client.torrent_stats(&infohash).await.unwrap().uploaded, 16);

    client.disconnect(&infohash, &peer).await.unwrap();
    let received = leecher.await.unwrap();
    assert_eq!(received, vec![(0, data[16..24].to_vec()), (8, data[24..32].to_vec())]);
}

#[tokio::test]
async fn test_load_files_and_recheck() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let data = content(40);
    let infohash = client.load(&single_file_torrent(&data, 16, None)).await.unwrap();

    let mut files = BTreeMap::new();
    files.insert("file.bin".to_string(), data[..20].to_vec());
    files.insert("unrelated".to_string(), vec![1, 2, 3]);
    client.load_files(&infohash, &files).await.unwrap();

    let mut expected = data[..20].to_vec();
    expected.resize(40, 0);
    assert_eq!(client.files(&infohash).await.unwrap()["file.bin"], expected);

    assert!(!client.recheck(&infohash).await.unwrap());
    let stats = client.torrent_stats(&infohash).await.unwrap();
    assert_eq!((stats.pieces, stats.have_pieces, stats.left), (3, 1, 24));
    assert_eq!(client.files(&infohash).await.unwrap()["file.bin"][16..20], [0u8; 4]);
}

#[tokio::test]
async fn test_start_stop_and_inbound_handshake() {
    let http = Arc::new(ScriptedHttp::default());
    let (client, _) = client(http.clone());
    let infohash = client.load(&single_file_torrent(b"abcdef", 4, None)).await.unwrap();

    let err = client.stop().await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::NotListening));

    client.start().await.unwrap();
    let err = client.start().await.unwrap_err();
    assert!(matches!(kind(&err), TorrentError::AlreadyListening { .. }));

    let port = client.listen_addr().await.unwrap().port();
    let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let info_hash = parse_infohash(&infohash).unwrap();
    socket.write_all(&Handshake::new(info_hash, *MOCK_PEER_ID).serialize()).await.unwrap();
    let mut raw = [0u8; 68];
    socket.read_exact(&mut raw).await.unwrap();
    let answer = Handshake::deserialize(&raw).unwrap();
    assert!(answer.validate(&info_hash));
    assert_eq!(answer.peer_id, client.peer_id());

    let mut recorded = false;
    for _ in 0..50 {
        let known = client.known_peers(&infohash).await.unwrap();
        if known.iter().any(|p| p.peer_id.as_deref() == Some("-MK0001-mockpeer0001")) {
            recorded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(recorded);
    assert_eq!(client.connected_peers(&infohash).await.unwrap().len(), 1);

    client.stop().await.unwrap();
    assert!(client.connected_peers(&infohash).await.unwrap().is_empty());
    assert!(client.listen_addr().await.is_none());
}
