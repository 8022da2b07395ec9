//! Keyed registry of shared state
//!
//! Maps an infohash to an owned, individually locked sub-state so that work
//! on one torrent never waits on another.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Concurrency-safe map from key to shared entry
#[derive(Debug)]
pub struct KeyedRegistry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for KeyedRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> KeyedRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Return the entry for `key`, creating it with `init` when absent
    pub async fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(entry) = self.get(key).await {
            return entry;
        }
        let mut entries = self.entries.write().await;
        entries.entry(key.to_string()).or_insert_with(|| Arc::new(init())).clone()
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<T>> {
        self.entries.write().await.remove(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn values(&self) -> Vec<Arc<T>> {
        self.entries.read().await.values().cloned().collect()
    }
}
