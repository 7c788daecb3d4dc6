use flate2::write::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::rpc_client::{fetch_latest_snapshot, SnapshotProvider};
use crate::constants::snapshot::DEFAULT_FORMAT;
use crate::database::Database;
use crate::errors::StateSyncError;
use crate::snapshot::types::{chunk_file_name, sha256};
use crate::snapshot::{DumpTool, Hash, Snapshot};

const READ_BUFFER: usize = 64 * 1024;

/// Outcome of applying one snapshot chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk stored, more are needed
    Accepted,
    /// Chunk was already received
    AlreadyApplied,
    /// Last chunk stored and the database restored
    Restored,
}

#[derive(Debug)]
enum SyncState {
    Idle,
    Collecting {
        snapshot: Snapshot,
        received: Vec<bool>,
        received_count: u32,
    },
}

/// Receiver side of snapshot bootstrap: validates an offered snapshot against
/// trusted providers, collects its chunks and restores the database from them.
pub struct StateSyncer {
    chunk_dir: PathBuf,
    db: Database,
    canonical_table: String,
    dump_tool: Arc<dyn DumpTool>,
    providers: Vec<Arc<dyn SnapshotProvider>>,
    state: Mutex<SyncState>,
}

impl StateSyncer {
    pub async fn new(
        chunk_dir: impl Into<PathBuf>,
        db: Database,
        canonical_table: &str,
        dump_tool: Arc<dyn DumpTool>,
        providers: Vec<Arc<dyn SnapshotProvider>>,
    ) -> Result<Self, StateSyncError> {
        let chunk_dir = chunk_dir.into();
        reset_dir(&chunk_dir)
            .await
            .map_err(|reason| StateSyncError::AbortSnapshot { reason })?;

        Ok(Self {
            chunk_dir,
            db,
            canonical_table: canonical_table.to_string(),
            dump_tool,
            providers,
            state: Mutex::new(SyncState::Idle),
        })
    }

    /// Height of the snapshot being collected, if any
    pub async fn in_progress(&self) -> Option<u64> {
        match &*self.state.lock().await {
            SyncState::Idle => None,
            SyncState::Collecting { snapshot, .. } => Some(snapshot.height),
        }
    }

    /// Number of distinct chunks received for the active snapshot
    pub async fn received_chunks(&self) -> u32 {
        match &*self.state.lock().await {
            SyncState::Idle => 0,
            SyncState::Collecting { received_count, .. } => *received_count,
        }
    }

    #[instrument(skip(self, snapshot), fields(height = snapshot.height))]
    pub async fn offer_snapshot(&self, snapshot: Snapshot) -> Result<(), StateSyncError> {
        let mut state = self.state.lock().await;
        if let SyncState::Collecting { snapshot: active, .. } = &*state {
            return Err(StateSyncError::AlreadyInProgress {
                height: active.height,
            });
        }

        if snapshot.format != DEFAULT_FORMAT {
            return Err(StateSyncError::UnsupportedFormat {
                format: snapshot.format,
            });
        }
        snapshot
            .check_shape()
            .map_err(|reason| StateSyncError::InvalidSnapshot { reason })?;

        self.verify_with_providers(&snapshot).await?;

        if !self.db.is_empty(&self.canonical_table).await? {
            return Err(StateSyncError::DatabaseNotEmpty);
        }

        reset_dir(&self.chunk_dir)
            .await
            .map_err(|reason| StateSyncError::AbortSnapshot { reason })?;

        info!(
            "Accepted snapshot at height {} ({} chunks, {} bytes)",
            snapshot.height, snapshot.chunk_count, snapshot.snapshot_size
        );
        let count = snapshot.chunk_count as usize;
        *state = SyncState::Collecting {
            snapshot,
            received: vec![false; count],
            received_count: 0,
        };
        Ok(())
    }

    pub async fn apply_snapshot_chunk(
        &self,
        bytes: &[u8],
        index: u32,
    ) -> Result<ChunkOutcome, StateSyncError> {
        let mut state = self.state.lock().await;
        let SyncState::Collecting {
            snapshot,
            received,
            received_count,
        } = &mut *state
        else {
            return Err(StateSyncError::NotInProgress);
        };

        if index >= snapshot.chunk_count {
            return Err(StateSyncError::RejectChunk {
                index,
                reason: format!("snapshot has {} chunks", snapshot.chunk_count),
            });
        }
        if received[index as usize] {
            debug!("Snapshot chunk {} already received", index);
            return Ok(ChunkOutcome::AlreadyApplied);
        }
        if sha256(bytes) != snapshot.chunk_hashes[index as usize] {
            warn!("Snapshot chunk {} hash mismatch, requesting refetch", index);
            return Err(StateSyncError::RefetchChunk { index });
        }

        let path = self.chunk_dir.join(chunk_file_name(index));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StateSyncError::RetryChunk {
                index,
                reason: e.to_string(),
            })?;

        received[index as usize] = true;
        *received_count += 1;
        debug!(
            "Stored snapshot chunk {} ({}/{})",
            index, received_count, snapshot.chunk_count
        );

        if *received_count < snapshot.chunk_count {
            return Ok(ChunkOutcome::Accepted);
        }

        let snapshot = snapshot.clone();
        let result = self.restore(&snapshot).await;
        *state = SyncState::Idle;

        if let Err(reason) = reset_dir(&self.chunk_dir).await {
            error!("Failed to clear snapshot chunks: {}", reason);
        }

        match result {
            Ok(()) => {
                info!("✓ Database restored from snapshot at height {}", snapshot.height);
                Ok(ChunkOutcome::Restored)
            }
            Err(e) => {
                error!("Restore of snapshot at height {} failed: {}", snapshot.height, e);
                Err(e)
            }
        }
    }

    /// Drops any in-flight transfer and returns to idle
    pub async fn abort(&self) {
        let mut state = self.state.lock().await;
        if let SyncState::Collecting { snapshot, .. } = &*state {
            warn!("Aborting state sync of snapshot at height {}", snapshot.height);
        }
        *state = SyncState::Idle;
        if let Err(reason) = reset_dir(&self.chunk_dir).await {
            error!("Failed to clear snapshot chunks: {}", reason);
        }
    }

    /// Discovers the latest snapshot from the providers, downloads every chunk
    /// and restores it. Chunks failing verification are fetched again from the
    /// next provider.
    pub async fn bootstrap(&self) -> anyhow::Result<Snapshot> {
        let snapshot = fetch_latest_snapshot(&self.providers).await?;
        self.offer_snapshot(snapshot.clone()).await?;

        let attempts_per_chunk = self.providers.len().max(1) * 2;
        for index in 0..snapshot.chunk_count {
            let mut attempt = 0;
            loop {
                let provider = &self.providers[(index as usize + attempt) % self.providers.len()];
                attempt += 1;

                let outcome = match provider
                    .load_chunk(snapshot.height, snapshot.format, index)
                    .await
                {
                    Ok(bytes) => self.apply_snapshot_chunk(&bytes, index).await,
                    Err(e) => {
                        warn!("Chunk {} from {} failed: {}", index, provider.name(), e);
                        Err(StateSyncError::RetryChunk {
                            index,
                            reason: e.to_string(),
                        })
                    }
                };

                match outcome {
                    Ok(_) => break,
                    Err(StateSyncError::RefetchChunk { .. } | StateSyncError::RetryChunk { .. })
                        if attempt < attempts_per_chunk =>
                    {
                        continue
                    }
                    Err(e) => {
                        self.abort().await;
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(snapshot)
    }

    async fn verify_with_providers(&self, snapshot: &Snapshot) -> Result<(), StateSyncError> {
        for provider in &self.providers {
            match provider.snapshot_at(snapshot.height).await {
                Ok(Some(trusted)) => {
                    if trusted.matches(snapshot) {
                        info!(
                            "✓ Snapshot at height {} verified by {}",
                            snapshot.height,
                            provider.name()
                        );
                        return Ok(());
                    }
                    error!(
                        "Snapshot at height {} does not match provider {}",
                        snapshot.height,
                        provider.name()
                    );
                    return Err(StateSyncError::InvalidSnapshot {
                        reason: format!("does not match trusted provider {}", provider.name()),
                    });
                }
                Ok(None) => {
                    debug!(
                        "Provider {} has no snapshot at height {}",
                        provider.name(),
                        snapshot.height
                    );
                }
                Err(e) => {
                    info!("Failed to query provider {}: {}", provider.name(), e);
                }
            }
        }

        Err(StateSyncError::InvalidSnapshot {
            reason: "no trusted provider confirmed the snapshot".to_string(),
        })
    }

    /// Streams every chunk through gzip into the restore tool while hashing
    /// the decompressed bytes
    async fn restore(&self, snapshot: &Snapshot) -> Result<(), StateSyncError> {
        if !self.db.is_empty(&self.canonical_table).await? {
            return Err(StateSyncError::DatabaseNotEmpty);
        }

        let abort = |reason: String| StateSyncError::AbortSnapshot { reason };
        let mut sink = self
            .dump_tool
            .begin_restore()
            .await
            .map_err(|e| abort(e.to_string()))?;

        let mut decoder = GzDecoder::new(Vec::new());
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_BUFFER];

        for index in 0..snapshot.chunk_count {
            let path = self.chunk_dir.join(chunk_file_name(index));
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| abort(format!("{}: {}", path.display(), e)))?;

            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| abort(format!("{}: {}", path.display(), e)))?;
                if n == 0 {
                    break;
                }
                decoder
                    .write_all(&buf[..n])
                    .map_err(|e| abort(format!("decompression failed: {}", e)))?;

                let plain = std::mem::take(decoder.get_mut());
                if !plain.is_empty() {
                    hasher.update(&plain);
                    sink.write_all(&plain).await.map_err(|e| abort(e.to_string()))?;
                }
            }
        }

        let tail = decoder
            .finish()
            .map_err(|e| abort(format!("decompression failed: {}", e)))?;
        if !tail.is_empty() {
            hasher.update(&tail);
            sink.write_all(&tail).await.map_err(|e| abort(e.to_string()))?;
        }

        let hash: Hash = hasher.finalize().into();
        if hash != snapshot.snapshot_hash {
            // Dropping the sink kills the restore tool
            drop(sink);
            return Err(StateSyncError::RejectSnapshot {
                reason: format!(
                    "restored stream hash {} does not match {}",
                    hex::encode(hash),
                    hex::encode(snapshot.snapshot_hash)
                ),
            });
        }

        sink.finish().await.map_err(|e| abort(e.to_string()))
    }
}

async fn reset_dir(dir: &Path) -> Result<(), String> {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(format!("{}: {}", dir.display(), e));
        }
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("{}: {}", dir.display(), e))
}
