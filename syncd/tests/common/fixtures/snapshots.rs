//! Real snapshots built on disk from a scripted dump

use std::path::Path;
use std::sync::Arc;

use syncd::constants::snapshot::DEFAULT_FORMAT;
use syncd::snapshot::types::chunk_path;
use syncd::snapshot::{Snapshot, SnapshotStore, SnapshotStoreConfig, Snapshotter};

use super::fake_dump::FakeDumpTool;

/// Small chunk size so fixture snapshots span several chunks
pub const TEST_CHUNK_SIZE: u64 = 64;

pub fn store_config(dir: &Path, max_snapshots: usize, recurring_height: u64) -> SnapshotStoreConfig {
    SnapshotStoreConfig {
        dir: dir.to_path_buf(),
        max_snapshots,
        recurring_height,
        chunk_size: TEST_CHUNK_SIZE,
        max_row_size: 1024 * 1024,
        schemas: vec!["kwild_accts".to_string()],
        exclude_tables: Vec::new(),
        exclude_table_data: Vec::new(),
    }
}

/// Creates a snapshot of `script` at `height` and reads its chunk bodies back
pub async fn build_snapshot(dir: &Path, script: &str, height: u64) -> (Snapshot, Vec<Vec<u8>>) {
    let snapshotter = Snapshotter::new(
        dir,
        Arc::new(FakeDumpTool::new(script)),
        TEST_CHUNK_SIZE,
        1024 * 1024,
    );
    let snapshot = snapshotter
        .create_snapshot(height, "fixture", &["kwild_accts".to_string()], &[], &[])
        .await
        .unwrap();
    let chunks = read_chunks(dir, &snapshot).await;
    (snapshot, chunks)
}

pub async fn read_chunks(dir: &Path, snapshot: &Snapshot) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    for index in 0..snapshot.chunk_count {
        let path = chunk_path(dir, snapshot.height, DEFAULT_FORMAT, index);
        chunks.push(tokio::fs::read(&path).await.unwrap());
    }
    chunks
}

pub async fn open_store(dir: &Path, max_snapshots: usize, dump: FakeDumpTool) -> SnapshotStore {
    SnapshotStore::new(store_config(dir, max_snapshots, 0), Arc::new(dump))
        .await
        .unwrap()
}
