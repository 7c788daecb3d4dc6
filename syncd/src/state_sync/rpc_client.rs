use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::constants::http::CONNECT_TIMEOUT;
use crate::snapshot::Snapshot;
use crate::web::ApiResponse;

/// A peer whose locally held snapshot metadata is trusted for validation
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Metadata of the provider's snapshot at `height`, if it has one
    async fn snapshot_at(&self, height: u64) -> Result<Option<Snapshot>>;

    async fn latest_snapshot(&self) -> Result<Option<Snapshot>>;

    async fn load_chunk(&self, height: u64, format: u32, index: u32) -> Result<Vec<u8>>;
}

/// Provider reached over the node's HTTP surface
pub struct HttpSnapshotProvider {
    base_url: String,
    client: Client,
}

impl HttpSnapshotProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn query_snapshot(&self, url: &str) -> Result<Option<Snapshot>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to query {}: {}", url, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!(
                "Provider {} returned status: {}",
                self.base_url,
                response.status()
            ));
        }

        let body: ApiResponse<Snapshot> = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse snapshot response: {}", e))?;
        Ok(body.data)
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn snapshot_at(&self, height: u64) -> Result<Option<Snapshot>> {
        let url = format!("{}/snapshot/height/{}", self.base_url, height);
        self.query_snapshot(&url).await
    }

    async fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        let url = format!("{}/snapshot/latest", self.base_url);
        self.query_snapshot(&url).await
    }

    async fn load_chunk(&self, height: u64, format: u32, index: u32) -> Result<Vec<u8>> {
        let url = format!(
            "{}/snapshot/{}/{}/chunks/{}",
            self.base_url, height, format, index
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to fetch chunk {}: {}", url, e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Provider {} returned status {} for chunk {}",
                self.base_url,
                response.status(),
                index
            ));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

/// Builds HTTP providers for every configured URL
pub fn http_providers(urls: &[String], timeout: Duration) -> Result<Vec<Arc<dyn SnapshotProvider>>> {
    urls.iter()
        .map(|url| {
            HttpSnapshotProvider::new(url, timeout)
                .map(|provider| Arc::new(provider) as Arc<dyn SnapshotProvider>)
        })
        .collect()
}

/// Asks each provider in turn for its latest snapshot; the first answer wins
pub async fn fetch_latest_snapshot(providers: &[Arc<dyn SnapshotProvider>]) -> Result<Snapshot> {
    let mut last_error = None;

    for provider in providers {
        info!("Querying latest snapshot from {}", provider.name());
        match provider.latest_snapshot().await {
            Ok(Some(snapshot)) => {
                info!(
                    "✓ {} offers snapshot at height {} ({} chunks)",
                    provider.name(),
                    snapshot.height,
                    snapshot.chunk_count
                );
                return Ok(snapshot);
            }
            Ok(None) => info!("{} has no snapshots", provider.name()),
            Err(e) => {
                warn!("Provider {} failed: {}", provider.name(), e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("No provider offered a snapshot")))
}
