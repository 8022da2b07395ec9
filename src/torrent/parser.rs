//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use anyhow::Result;
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{debug, error, info, trace};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::torrent::info::{build_piece_table, generate_info_hash, parse_piece_hashes, Metainfo, TorrentFile};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<Metainfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data).map_err(|e| {
            error!("Torrent file is not valid bencode: {}", e);
            TorrentError::invalid_torrent_with_source("Torrent file is not valid bencode", e.to_string())
        })?;
        let root_dict = root
            .as_dict()
            .ok_or_else(|| TorrentError::invalid_torrent("Root must be a dictionary"))?;

        // The infohash covers the original bytes of `info`, not a re-encoding
        let info_bytes = bencode::dict_value_span(data, b"info")?
            .ok_or_else(|| TorrentError::invalid_torrent("Missing info dictionary"))?;
        let info_hash = generate_info_hash(info_bytes);
        debug!("Computed info hash: {}", hex::encode(info_hash));

        let announce_list = Self::announce_list(root_dict)?;
        debug!("Announce list has {} tier(s)", announce_list.len());

        let info_dict = root_dict
            .get(b"info".as_slice())
            .and_then(Value::as_dict)
            .ok_or_else(|| TorrentError::invalid_torrent("info must be a dictionary"))?;

        let piece_length = get_int(info_dict, b"piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::invalid_torrent_with_source(
                "Invalid piece length",
                format!("got {}", piece_length),
            )
            .into());
        }
        let piece_length = piece_length as u64;

        let hashes = parse_piece_hashes(get_bytes(info_dict, b"pieces")?)?;
        let files = Self::file_layout(info_dict)?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let pieces = build_piece_table(&hashes, piece_length, total_length)?;

        info!(
            "Parsed torrent {}: {} file(s), {} piece(s), {} bytes",
            hex::encode(info_hash),
            files.len(),
            pieces.len(),
            total_length
        );
        Ok(Metainfo {
            info_hash,
            announce_list,
            piece_length,
            pieces,
            files,
        })
    }

    fn announce_list(root: &BTreeMap<Bytes, Value>) -> Result<Vec<Vec<String>>> {
        if let Some(tiers) = root.get(b"announce-list".as_slice()) {
            let tiers = tiers
                .as_list()
                .ok_or_else(|| TorrentError::invalid_torrent("announce-list must be a list"))?;
            let mut result = Vec::with_capacity(tiers.len());
            for tier in tiers {
                let urls = tier
                    .as_list()
                    .ok_or_else(|| TorrentError::invalid_torrent("announce-list tier must be a list"))?;
                let urls = urls
                    .iter()
                    .map(|url| {
                        url.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| TorrentError::invalid_torrent("Tracker URL must be a string"))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if !urls.is_empty() {
                    result.push(urls);
                }
            }
            return Ok(result);
        }

        let announce = root
            .get(b"announce".as_slice())
            .and_then(Value::as_str)
            .ok_or_else(|| TorrentError::invalid_torrent("Missing announce field"))?;
        Ok(vec![vec![announce.to_string()]])
    }

    fn file_layout(info: &BTreeMap<Bytes, Value>) -> Result<Vec<TorrentFile>> {
        let Some(files) = info.get(b"files".as_slice()) else {
            // Single file
            let name = get_str(info, b"name")?;
            let length = get_length(info)?;
            return Ok(vec![TorrentFile {
                name,
                file_index: 0,
                offset: 0,
                length,
            }]);
        };

        let files = files
            .as_list()
            .ok_or_else(|| TorrentError::invalid_torrent("files must be a list"))?;
        let mut offset = 0u64;
        let mut layout = Vec::with_capacity(files.len());
        for (i, entry) in files.iter().enumerate() {
            let entry = entry
                .as_dict()
                .ok_or_else(|| TorrentError::invalid_torrent("files entry must be a dictionary"))?;
            let length = get_length(entry)?;
            let components = entry
                .get(b"path".as_slice())
                .and_then(Value::as_list)
                .ok_or_else(|| TorrentError::invalid_torrent("Missing file path"))?;
            let name = components
                .iter()
                .map(|c| c.as_str().ok_or_else(|| TorrentError::invalid_torrent("Path component must be a string")))
                .collect::<std::result::Result<Vec<_>, _>>()?
                .join("/");

            trace!("File {}: {} at offset {} ({} bytes)", i, name, offset, length);
            layout.push(TorrentFile {
                name,
                file_index: i as u32,
                offset,
                length,
            });
            offset += length;
        }
        Ok(layout)
    }
}

fn get_int(dict: &BTreeMap<Bytes, Value>, key: &[u8]) -> Result<i64> {
    dict.get(key).and_then(Value::as_integer).ok_or_else(|| {
        let key = String::from_utf8_lossy(key);
        error!("Missing or mistyped integer field '{}'", key);
        TorrentError::invalid_torrent(format!("Missing or invalid '{}'", key)).into()
    })
}

fn get_bytes<'a>(dict: &'a BTreeMap<Bytes, Value>, key: &[u8]) -> Result<&'a [u8]> {
    dict.get(key).and_then(Value::as_bytes).map(|b| b.as_ref()).ok_or_else(|| {
        let key = String::from_utf8_lossy(key);
        error!("Missing or mistyped byte string field '{}'", key);
        TorrentError::invalid_torrent(format!("Missing or invalid '{}'", key)).into()
    })
}

fn get_str(dict: &BTreeMap<Bytes, Value>, key: &[u8]) -> Result<String> {
    let bytes = get_bytes(dict, key)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn get_length(dict: &BTreeMap<Bytes, Value>) -> Result<u64> {
    let length = get_int(dict, b"length")?;
    u64::try_from(length).map_err(|_| TorrentError::invalid_torrent("Negative file length").into())
}
