//! Torrent information structures
//!
//! The piece table and file layout extracted from a metainfo file. Both are
//! persisted through the storage port, hence the serde derives.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// One piece of the concatenated torrent stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub index: u32,
    /// Piece length in bytes; only the last piece may be shorter than `piece length`
    pub length: u32,
    /// Expected SHA-1 of the piece data
    #[serde(with = "serde_bytes")]
    pub hash: Vec<u8>,
    /// Piece contents, `None` until downloaded and verified
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub data: Option<Vec<u8>>,
}

impl Piece {
    pub fn is_downloaded(&self) -> bool {
        self.data.is_some()
    }

    /// Check `data` against the recorded hash
    pub fn verify(&self, data: &[u8]) -> bool {
        hash_bytes(data).as_slice() == self.hash.as_slice()
    }
}

/// A file in the torrent, addressed by its offset in the concatenated stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    /// Path components joined with `/`
    pub name: String,
    pub file_index: u32,
    pub offset: u64,
    pub length: u64,
}

/// Everything `load` needs from a parsed metainfo file
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: [u8; 20],
    /// Tiers of tracker URLs, `announce-list` when present, else `[[announce]]`
    pub announce_list: Vec<Vec<String>>,
    pub piece_length: u64,
    pub pieces: Vec<Piece>,
    pub files: Vec<TorrentFile>,
}

impl Metainfo {
    /// Infohash as the 40-character lowercase hex key
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

/// SHA-1 over the raw bytes of the info dictionary
pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
    hash_bytes(info_dict_bytes)
}

pub(crate) fn hash_bytes(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Split the concatenated `pieces` field into 20-byte digests
pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::invalid_torrent_with_source(
            "Pieces field length must be a multiple of 20",
            format!("got {}", pieces_bytes.len()),
        )
        .into());
    }

    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Build the piece table for `total_length` bytes split into `piece_length` pieces
pub fn build_piece_table(hashes: &[[u8; 20]], piece_length: u64, total_length: u64) -> Result<Vec<Piece>> {
    let count = total_length.div_ceil(piece_length) as usize;
    if hashes.len() < count {
        return Err(TorrentError::invalid_torrent_with_source(
            "Not enough piece hashes",
            format!("need {}, got {}", count, hashes.len()),
        )
        .into());
    }

    Ok((0..count)
        .map(|i| {
            let start = i as u64 * piece_length;
            let length = piece_length.min(total_length - start);
            Piece {
                index: i as u32,
                length: length as u32,
                hash: hashes[i].to_vec(),
                data: None,
            }
        })
        .collect())
}
