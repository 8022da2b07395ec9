//! Key-value storage port
//!
//! The client persists every record through this byte-oriented interface so
//! that it can run against an in-memory map in tests and a JSON file from the
//! binary.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::error::TorrentError;

/// Abstract byte-key to byte-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, `None` if absent
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    async fn write(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    async fn delete(&self, key: &[u8]) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object of hex-encoded keys and values
///
/// The file is re-read on every access so several processes can share it
/// between runs; writes within one process are serialized.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match fs::read(&self.path).await {
            Ok(data) if data.is_empty() => Ok(BTreeMap::new()),
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                error!("Corrupt state file '{}': {}", self.path.display(), e);
                TorrentError::storage_error_full("Corrupt state file", self.path.display().to_string(), e.to_string()).into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("State file '{}' does not exist yet", self.path.display());
                Ok(BTreeMap::new())
            }
            Err(e) => {
                error!("Failed to read state file '{}': {}", self.path.display(), e);
                Err(TorrentError::storage_error_full("Failed to read state file", self.path.display().to_string(), e.to_string()).into())
            }
        }
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create state directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create state directory", parent.display().to_string(), e.to_string())
                })?;
            }
        }
        let data = serde_json::to_vec_pretty(entries).map_err(TorrentError::from)?;
        fs::write(&self.path, data).await.map_err(|e| {
            error!("Failed to write state file '{}': {}", self.path.display(), e);
            TorrentError::storage_error_full("Failed to write state file", self.path.display().to_string(), e.to_string())
        })?;
        debug!("Saved {} entries to '{}'", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        let entries = self.load().await?;
        match entries.get(&hex::encode(key)) {
            Some(value) => {
                let bytes = hex::decode(value).map_err(|e| {
                    TorrentError::storage_error_full("Stored value is not hex", String::from_utf8_lossy(key), e.to_string())
                })?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(hex::encode(key), hex::encode(value));
        self.save(&entries).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.remove(&hex::encode(key)).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }
}
