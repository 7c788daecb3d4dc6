use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::file_store::ChangesetMetadata;
use crate::constants::http::CONNECT_TIMEOUT;
use crate::web::ApiResponse;

/// The source chain's changeset surface
#[async_trait]
pub trait ChangesetSource: Send + Sync {
    fn name(&self) -> &str;

    /// Chunk layout of the changeset at `height`; `None` while the source has
    /// not recorded that height yet
    async fn changeset_metadata(&self, height: u64) -> Result<Option<ChangesetMetadata>>;

    async fn changeset_chunk(&self, height: u64, index: u32) -> Result<Vec<u8>>;
}

pub struct HttpChangesetSource {
    base_url: String,
    client: Client,
}

impl HttpChangesetSource {
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
}

#[async_trait]
impl ChangesetSource for HttpChangesetSource {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn changeset_metadata(&self, height: u64) -> Result<Option<ChangesetMetadata>> {
        let url = format!("{}/migration/changesets/{}/metadata", self.base_url, height);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to query {}: {}", url, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!(
                "Source {} returned status {} for changeset metadata at height {}",
                self.base_url,
                response.status(),
                height
            ));
        }

        let body: ApiResponse<ChangesetMetadata> = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse changeset metadata: {}", e))?;
        body.data
            .map(Some)
            .ok_or_else(|| anyhow!("Changeset metadata response for height {} had no data", height))
    }

    async fn changeset_chunk(&self, height: u64, index: u32) -> Result<Vec<u8>> {
        let url = format!(
            "{}/migration/changesets/{}/chunks/{}",
            self.base_url, height, index
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to fetch {}: {}", url, e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Source {} returned status {} for changeset chunk {} at height {}",
                self.base_url,
                response.status(),
                index,
                height
            ));
        }

        Ok(response.bytes().await?.to_vec())
    }
}
