//! In-memory snapshot providers and changeset sources

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use syncd::migrations::{ChangesetMetadata, ChangesetSource};
use syncd::snapshot::Snapshot;
use syncd::state_sync::SnapshotProvider;

/// Provider serving one fixed snapshot and its chunk bodies
pub struct StaticProvider {
    name: String,
    snapshot: Option<Snapshot>,
    chunks: Vec<Vec<u8>>,
    /// Chunk indexes served corrupted once before the real bytes
    corrupt_once: Mutex<Vec<u32>>,
}

impl StaticProvider {
    pub fn new(name: &str, snapshot: Option<Snapshot>, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            snapshot,
            chunks,
            corrupt_once: Mutex::new(Vec::new()),
        }
    }

    pub fn corrupt_once(self, index: u32) -> Self {
        self.corrupt_once.lock().unwrap().push(index);
        self
    }
}

#[async_trait]
impl SnapshotProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn snapshot_at(&self, height: u64) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone().filter(|s| s.height == height))
    }

    async fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }

    async fn load_chunk(&self, _height: u64, _format: u32, index: u32) -> Result<Vec<u8>> {
        let mut corrupt = self.corrupt_once.lock().unwrap();
        if let Some(pos) = corrupt.iter().position(|i| *i == index) {
            corrupt.remove(pos);
            return Ok(b"garbage".to_vec());
        }
        self.chunks
            .get(index as usize)
            .cloned()
            .ok_or_else(|| anyhow!("no chunk {}", index))
    }
}

/// Changeset source backed by a map of height to serving chunks
#[derive(Default)]
pub struct MemorySource {
    heights: Mutex<HashMap<u64, Vec<Vec<u8>>>>,
    /// Metadata requests failing before the source answers
    pub failures: AtomicU32,
    pub metadata_calls: AtomicU32,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a height whose changeset is split into the given chunks
    pub fn record(&self, height: u64, chunks: Vec<Vec<u8>>) {
        self.heights.lock().unwrap().insert(height, chunks);
    }

    /// Records `data` split into `chunk_size` pieces; empty data gives no chunks
    pub fn record_bytes(&self, height: u64, data: &[u8], chunk_size: usize) {
        let chunks = data.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        self.record(height, chunks);
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangesetSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn changeset_metadata(&self, height: u64) -> Result<Option<ChangesetMetadata>> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("source unavailable"));
        }

        let heights = self.heights.lock().unwrap();
        Ok(heights.get(&height).map(|chunks| ChangesetMetadata {
            height,
            chunks: chunks.len() as u32,
            chunk_sizes: chunks.iter().map(|c| c.len() as u64).collect(),
        }))
    }

    async fn changeset_chunk(&self, height: u64, index: u32) -> Result<Vec<u8>> {
        let heights = self.heights.lock().unwrap();
        heights
            .get(&height)
            .and_then(|chunks| chunks.get(index as usize))
            .cloned()
            .ok_or_else(|| anyhow!("no chunk {} at height {}", index, height))
    }
}
