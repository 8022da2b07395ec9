//! HTTP port used to reach trackers

use anyhow::Result;
use async_trait::async_trait;

/// Fetches the raw body of a tracker URL
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

#[cfg(feature = "http")]
pub use self::reqwest_client::ReqwestHttpClient;

#[cfg(feature = "http")]
mod reqwest_client {
    use super::HttpClient;
    use crate::error::TorrentError;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;
    use tracing::{debug, error};

    const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

    /// `HttpClient` backed by `reqwest`
    pub struct ReqwestHttpClient {
        client: reqwest::Client,
    }

    impl ReqwestHttpClient {
        pub fn new() -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .map_err(|e| TorrentError::config_error_with_field(format!("Failed to build HTTP client: {}", e), "http"))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl HttpClient for ReqwestHttpClient {
        async fn get(&self, url: &str) -> Result<Vec<u8>> {
            debug!("GET {}", url);
            let response = self.client.get(url).send().await.map_err(|e| {
                error!("Tracker request failed: {}", e);
                TorrentError::tracker_failure(format!("Request failed: {}", e))
            })?;

            let status = response.status();
            if !status.is_success() {
                error!("Tracker answered with status {}", status);
                return Err(TorrentError::tracker_failure(format!("HTTP status {}", status)).into());
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| TorrentError::tracker_failure(format!("Failed to read response: {}", e)))?;
            Ok(body.to_vec())
        }
    }
}
