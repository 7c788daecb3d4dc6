use async_trait::async_trait;
use glob::glob;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dump::DumpTool;
use super::snapshotter::Snapshotter;
use super::types::{chunk_path, header_path, height_dir, parse_height_dir, Snapshot};
use crate::constants::snapshot::DEFAULT_FORMAT;
use crate::database::Database;
use crate::errors::{SnapshotError, SyncError};
use crate::voting::{BlockContext, EndBlockHook};

/// Settings for one snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStoreConfig {
    pub dir: PathBuf,
    pub max_snapshots: usize,
    pub recurring_height: u64,
    pub chunk_size: u64,
    pub max_row_size: usize,
    pub schemas: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub exclude_table_data: Vec<String>,
}

/// Locally retained snapshots, bounded by `max_snapshots`
pub struct SnapshotStore {
    config: SnapshotStoreConfig,
    snapshotter: Snapshotter,
    snapshots: RwLock<BTreeMap<u64, Snapshot>>,
    creating: AtomicBool,
}

impl SnapshotStore {
    /// Opens the store, loading every valid snapshot already on disk
    pub async fn new(
        config: SnapshotStoreConfig,
        dump_tool: Arc<dyn DumpTool>,
    ) -> Result<Self, SnapshotError> {
        tokio::fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| SnapshotError::io(&config.dir, e))?;

        let snapshotter = Snapshotter::new(
            config.dir.clone(),
            dump_tool,
            config.chunk_size,
            config.max_row_size,
        );

        let store = Self {
            snapshots: RwLock::new(BTreeMap::new()),
            snapshotter,
            config,
            creating: AtomicBool::new(false),
        };
        store.load_existing().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// True iff a snapshot should be taken at `height`
    pub fn is_snapshot_due(&self, height: u64) -> bool {
        self.config.recurring_height != 0 && height % self.config.recurring_height == 0
    }

    /// Creates a snapshot through the Snapshotter and registers it
    pub async fn create_snapshot(
        &self,
        height: u64,
        snapshot_id: &str,
    ) -> Result<Snapshot, SnapshotError> {
        let snapshot = self
            .snapshotter
            .create_snapshot(
                height,
                snapshot_id,
                &self.config.schemas,
                &self.config.exclude_tables,
                &self.config.exclude_table_data,
            )
            .await?;
        self.register_snapshot(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Adds a snapshot to the index; a second registration at the same height is a no-op
    pub async fn register_snapshot(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let evicted = {
            let mut snapshots = self.snapshots.write().await;
            if snapshots.contains_key(&snapshot.height) {
                debug!("Snapshot at height {} already registered", snapshot.height);
                return Ok(());
            }
            info!("Registering snapshot at height {}", snapshot.height);
            snapshots.insert(snapshot.height, snapshot);
            Self::evict_over_budget(&mut snapshots, self.config.max_snapshots)
        };

        self.remove_dirs(&evicted).await
    }

    /// Retained snapshots in ascending height order
    pub async fn list_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.read().await.values().cloned().collect()
    }

    pub async fn snapshot_at(&self, height: u64) -> Option<Snapshot> {
        self.snapshots.read().await.get(&height).cloned()
    }

    pub async fn latest_snapshot(&self) -> Option<Snapshot> {
        self.snapshots
            .read()
            .await
            .last_key_value()
            .map(|(_, snapshot)| snapshot.clone())
    }

    pub async fn load_snapshot_chunk(
        &self,
        height: u64,
        format: u32,
        index: u32,
    ) -> Result<Vec<u8>, SnapshotError> {
        if format != DEFAULT_FORMAT {
            return Err(SnapshotError::UnsupportedFormat { format });
        }

        let chunk_count = {
            let snapshots = self.snapshots.read().await;
            let snapshot = snapshots
                .get(&height)
                .ok_or(SnapshotError::NotFound { height })?;
            snapshot.chunk_count
        };
        if index >= chunk_count {
            return Err(SnapshotError::ChunkOutOfRange {
                height,
                index,
                count: chunk_count,
            });
        }

        let path = chunk_path(&self.config.dir, height, format, index);
        tokio::fs::read(&path)
            .await
            .map_err(|e| SnapshotError::io(&path, e))
    }

    /// Block hook: when a snapshot is due, pins a consistent view and creates
    /// the snapshot in the background. The view is rolled back once the dump
    /// is done. Returns `None` when nothing was started.
    pub async fn snapshot_if_due(
        self: &Arc<Self>,
        height: u64,
        db: &Database,
    ) -> Result<Option<JoinHandle<Result<Snapshot, SnapshotError>>>, SnapshotError> {
        if !self.is_snapshot_due(height) || self.snapshot_at(height).await.is_some() {
            return Ok(None);
        }
        if self.creating.swap(true, Ordering::SeqCst) {
            warn!(
                "Snapshot creation still running, skipping snapshot at height {}",
                height
            );
            return Ok(None);
        }

        let tx = match db.begin_snapshot_tx().await {
            Ok(tx) => tx,
            Err(e) => {
                self.creating.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let store = Arc::clone(self);
        Ok(Some(tokio::spawn(async move {
            let result = store.create_snapshot(height, tx.snapshot_id()).await;
            tx.rollback().await;
            store.creating.store(false, Ordering::SeqCst);
            if let Err(e) = &result {
                error!("Snapshot creation at height {} failed: {}", height, e);
            }
            result
        })))
    }

    async fn load_existing(&self) -> Result<(), SnapshotError> {
        let pattern = format!("{}/block-*", self.config.dir.display());
        let entries = glob(&pattern).map_err(|e| SnapshotError::Io {
            path: pattern.clone(),
            reason: e.to_string(),
        })?;

        let mut loaded = 0;
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Unreadable snapshot directory entry: {}", e);
                    continue;
                }
            };
            let Some(height) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_height_dir)
            else {
                continue;
            };

            match self.load_snapshot(height).await {
                Ok(snapshot) => {
                    self.snapshots.write().await.insert(height, snapshot);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping invalid snapshot at height {}: {}", height, e),
            }
        }

        let evicted = {
            let mut snapshots = self.snapshots.write().await;
            Self::evict_over_budget(&mut snapshots, self.config.max_snapshots)
        };
        self.remove_dirs(&evicted).await?;

        info!(
            "✓ Loaded {} snapshots from {}",
            loaded - evicted.len(),
            self.config.dir.display()
        );
        Ok(())
    }

    async fn load_snapshot(&self, height: u64) -> Result<Snapshot, SnapshotError> {
        let path = header_path(&self.config.dir, height, DEFAULT_FORMAT);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| SnapshotError::io(&path, e))?;
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| SnapshotError::InvalidHeader {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let invalid = |reason: String| SnapshotError::InvalidHeader {
            path: path.display().to_string(),
            reason,
        };
        if snapshot.height != height {
            return Err(invalid(format!(
                "header height {} does not match directory",
                snapshot.height
            )));
        }
        snapshot.check_shape().map_err(invalid)?;

        for index in 0..snapshot.chunk_count {
            let chunk = chunk_path(&self.config.dir, height, snapshot.format, index);
            match tokio::fs::try_exists(&chunk).await {
                Ok(true) => {}
                Ok(false) => return Err(SnapshotError::io(&chunk, "chunk file missing")),
                Err(e) => {
                    warn!("Failed to check chunk {}: {}", chunk.display(), e);
                    return Err(SnapshotError::io(&chunk, e));
                }
            }
        }

        Ok(snapshot)
    }

    /// Pops the lowest heights until the index fits the budget
    fn evict_over_budget(snapshots: &mut BTreeMap<u64, Snapshot>, max: usize) -> Vec<u64> {
        let mut evicted = Vec::new();
        while snapshots.len() > max {
            match snapshots.pop_first() {
                Some((height, _)) => evicted.push(height),
                None => break,
            }
        }
        evicted
    }

    async fn remove_dirs(&self, heights: &[u64]) -> Result<(), SnapshotError> {
        for height in heights {
            let dir = height_dir(&self.config.dir, *height);
            info!("Evicting snapshot at height {}", height);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(SnapshotError::io(&dir, e));
                }
            }
        }
        Ok(())
    }
}

/// End-block hook starting due snapshots in the background
pub struct RecurringSnapshots {
    store: Arc<SnapshotStore>,
    db: Database,
}

impl RecurringSnapshots {
    pub fn new(store: Arc<SnapshotStore>, db: Database) -> Self {
        Self { store, db }
    }
}

#[async_trait]
impl EndBlockHook for RecurringSnapshots {
    fn name(&self) -> &str {
        "recurring_snapshots"
    }

    async fn end_block(&self, block: &mut BlockContext) -> Result<(), SyncError> {
        // A failed snapshot does not halt the chain
        if let Err(e) = self.store.snapshot_if_due(block.height, &self.db).await {
            error!("Failed to start snapshot at height {}: {}", block.height, e);
        }
        Ok(())
    }
}
