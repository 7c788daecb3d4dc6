//! Mock HTTP server for a node's snapshot and migration surface

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use syncd::migrations::ChangesetMetadata;
use syncd::snapshot::Snapshot;

/// Mock server for a source chain node or trusted snapshot provider
pub struct MockSourceServer {
    pub server: MockServer,
    pub base_url: String,
}

impl MockSourceServer {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self { server, base_url }
    }

    fn envelope(data: serde_json::Value) -> serde_json::Value {
        json!({
            "success": true,
            "data": data,
            "message": null,
            "timestamp": "2026-01-01T00:00:00Z"
        })
    }

    fn not_found(message: &str) -> ResponseTemplate {
        ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "data": null,
            "message": message,
            "timestamp": "2026-01-01T00:00:00Z"
        }))
    }

    /// Mock `/snapshot/latest`
    pub async fn mock_latest_snapshot(&self, snapshot: &Snapshot) {
        Mock::given(method("GET"))
            .and(path("/snapshot/latest"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(Self::envelope(serde_json::to_value(snapshot).unwrap())),
            )
            .mount(&self.server)
            .await;
    }

    /// Mock `/snapshot/latest` for a node holding no snapshots
    pub async fn mock_no_snapshots(&self) {
        Mock::given(method("GET"))
            .and(path("/snapshot/latest"))
            .respond_with(Self::not_found("No snapshots available"))
            .mount(&self.server)
            .await;
    }

    /// Mock `/snapshot/height/{height}`
    pub async fn mock_snapshot_at(&self, snapshot: &Snapshot) {
        Mock::given(method("GET"))
            .and(path(format!("/snapshot/height/{}", snapshot.height)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(Self::envelope(serde_json::to_value(snapshot).unwrap())),
            )
            .mount(&self.server)
            .await;
    }

    /// Mock one snapshot chunk body
    pub async fn mock_snapshot_chunk(&self, height: u64, format: u32, index: u32, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/snapshot/{}/{}/chunks/{}", height, format, index)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&self.server)
            .await;
    }

    /// Mock changeset metadata and every chunk body for one height
    pub async fn mock_changeset(&self, height: u64, chunks: &[Vec<u8>]) {
        let sizes: Vec<u64> = chunks.iter().map(|c| c.len() as u64).collect();
        self.mock_changeset_metadata(height, &sizes).await;
        for (index, body) in chunks.iter().enumerate() {
            self.mock_changeset_chunk(height, index as u32, body).await;
        }
    }

    /// Mock only the metadata, declaring the given chunk sizes
    pub async fn mock_changeset_metadata(&self, height: u64, chunk_sizes: &[u64]) {
        let metadata = ChangesetMetadata {
            height,
            chunks: chunk_sizes.len() as u32,
            chunk_sizes: chunk_sizes.to_vec(),
        };
        Mock::given(method("GET"))
            .and(path(format!("/migration/changesets/{}/metadata", height)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(Self::envelope(serde_json::to_value(&metadata).unwrap())),
            )
            .mount(&self.server)
            .await;
    }

    pub async fn mock_changeset_chunk(&self, height: u64, index: u32, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/migration/changesets/{}/chunks/{}", height, index)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&self.server)
            .await;
    }

    /// Mock a height the source has not recorded yet
    pub async fn mock_changeset_not_recorded(&self, height: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/migration/changesets/{}/metadata", height)))
            .respond_with(Self::not_found(&format!(
                "No changeset recorded for height {}",
                height
            )))
            .mount(&self.server)
            .await;
    }

    /// Mock a server-side failure for changeset metadata
    pub async fn mock_changeset_error(&self, height: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/migration/changesets/{}/metadata", height)))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&self.server)
            .await;
    }
}
