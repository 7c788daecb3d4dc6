use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::changeset::{encode_entries, ChangesetEntry};
use super::file_store::{ChangesetFileStore, ChangesetMetadata};
use crate::database::Database;
use crate::errors::{MigrationError, SnapshotError, SyncError};
use crate::snapshot::{DumpTool, Hash, Snapshot, SnapshotStore, SnapshotStoreConfig};
use crate::voting::{BlockContext, EndBlockHook, ResolutionHandler};

const STATE_FILE: &str = "migration.json";
const GENESIS_FILE: &str = "genesis.json";

/// Range of source heights replicated to the successor chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationWindow {
    pub start_height: u64,
    pub end_height: u64,
    pub chain_id: String,
}

/// Genesis parameters handed to the successor chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisInfo {
    pub chain_id: String,
    pub start_height: u64,
    pub end_height: u64,
    #[serde(with = "crate::snapshot::types::hex_hash")]
    pub snapshot_hash: Hash,
}

/// Answer to the migration metadata query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMetadata {
    pub in_migration: bool,
    pub start_height: u64,
    pub end_height: u64,
    pub chain_id: String,
    pub genesis_snapshot: Option<Snapshot>,
    pub genesis: Option<GenesisInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MigrationState {
    window: Option<MigrationWindow>,
    in_progress: bool,
    last_changeset_height: Option<u64>,
}

/// Settings for the source-side migrator
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    pub dir: PathBuf,
    /// Chunk size for serving stored changesets
    pub changeset_chunk_size: u64,
    pub snapshot_chunk_size: u64,
    pub max_row_size: usize,
    pub schemas: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub exclude_table_data: Vec<String>,
}

/// Captures a genesis snapshot and every block's changeset over the active
/// migration window, and serves both to the successor chain
pub struct Migrator {
    dir: PathBuf,
    db: Database,
    snapshots: Arc<SnapshotStore>,
    changesets: ChangesetFileStore,
    state: Mutex<MigrationState>,
}

impl Migrator {
    pub async fn new(
        config: MigratorConfig,
        db: Database,
        dump_tool: Arc<dyn DumpTool>,
    ) -> Result<Self, MigrationError> {
        tokio::fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| MigrationError::io(&config.dir, e))?;

        let snapshots = SnapshotStore::new(
            SnapshotStoreConfig {
                dir: config.dir.join("snapshots"),
                max_snapshots: 1,
                recurring_height: 0,
                chunk_size: config.snapshot_chunk_size,
                max_row_size: config.max_row_size,
                schemas: config.schemas.clone(),
                exclude_tables: config.exclude_tables.clone(),
                exclude_table_data: config.exclude_table_data.clone(),
            },
            dump_tool,
        )
        .await?;

        let state = load_state(&config.dir.join(STATE_FILE)).await?;
        if let Some(window) = &state.window {
            info!(
                "Resuming migration to {} over heights {}..={}",
                window.chain_id, window.start_height, window.end_height
            );
        }

        Ok(Self {
            changesets: ChangesetFileStore::new(
                config.dir.join("changesets"),
                config.changeset_chunk_size,
            ),
            dir: config.dir,
            db,
            snapshots: Arc::new(snapshots),
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records a new migration window. Only one window may ever be declared.
    pub async fn declare_migration(
        &self,
        window: MigrationWindow,
        current_height: u64,
    ) -> Result<(), MigrationError> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.window {
            return Err(MigrationError::AlreadyActive {
                start_height: active.start_height,
                end_height: active.end_height,
            });
        }

        if window.chain_id.trim().is_empty() {
            return Err(MigrationError::InvalidWindow {
                reason: "chain id must not be empty".to_string(),
            });
        }
        if window.start_height <= current_height {
            return Err(MigrationError::InvalidWindow {
                reason: format!(
                    "start height {} is not after current height {}",
                    window.start_height, current_height
                ),
            });
        }
        if window.start_height >= window.end_height {
            return Err(MigrationError::InvalidWindow {
                reason: format!(
                    "start height {} must be below end height {}",
                    window.start_height, window.end_height
                ),
            });
        }

        let mut next = state.clone();
        next.window = Some(window.clone());
        self.persist(&next).await?;
        *state = next;

        info!(
            "✓ Migration to {} declared for heights {}..={}",
            window.chain_id, window.start_height, window.end_height
        );
        Ok(())
    }

    pub async fn active_window(&self) -> Option<MigrationWindow> {
        self.state.lock().await.window.clone()
    }

    /// Highest height with a recorded changeset
    pub async fn last_changeset_height(&self) -> Option<u64> {
        self.state.lock().await.last_changeset_height
    }

    /// True once `height` has reached the window start
    pub async fn in_migration(&self, height: u64) -> bool {
        match &self.state.lock().await.window {
            Some(window) => height >= window.start_height,
            None => false,
        }
    }

    /// Block hook run before commit with the block's changeset entries
    #[instrument(skip(self, block, entries), fields(height = block.height))]
    pub async fn notify_height(
        &self,
        block: &mut BlockContext,
        entries: &[ChangesetEntry],
    ) -> Result<(), MigrationError> {
        let mut state = self.state.lock().await;
        let Some(window) = state.window.clone() else {
            return Ok(());
        };
        let height = block.height;

        if height + 1 < window.start_height {
            return Ok(());
        }
        if height > window.end_height {
            error!(
                "Height {} is past the migration end height {}",
                height, window.end_height
            );
            return Err(MigrationError::HeightOutOfWindow {
                height,
                start: window.start_height,
                end: window.end_height,
            });
        }

        block.in_migration = true;

        if height + 1 == window.start_height {
            if !state.in_progress {
                let mut next = state.clone();
                next.in_progress = true;
                self.persist(&next).await?;
                *state = next;
                info!(
                    "Migration starts at next height {}, recording changesets",
                    window.start_height
                );
            }
            return Ok(());
        }

        if height == window.end_height {
            warn!("Migration end height {} reached, halting", height);
            return Err(MigrationError::NetworkHalted {
                chain_id: window.chain_id,
            });
        }

        if height == window.start_height {
            self.create_genesis(&window).await?;
        }

        let data = encode_entries(entries);
        self.changesets.store(height, &data).await?;

        let mut next = state.clone();
        next.in_progress = true;
        // A height replayed after a crash must not move the recorded range back
        next.last_changeset_height = Some(state.last_changeset_height.map_or(height, |last| last.max(height)));
        self.persist(&next).await?;
        *state = next;

        debug!(
            "Recorded changeset for height {} ({} entries, {} bytes)",
            height,
            entries.len(),
            data.len()
        );
        Ok(())
    }

    pub async fn migration_metadata(&self) -> Result<MigrationMetadata, MigrationError> {
        let state = self.state.lock().await.clone();
        let window = state.window.ok_or(MigrationError::NoActiveMigration)?;

        let mut metadata = MigrationMetadata {
            in_migration: false,
            start_height: window.start_height,
            end_height: window.end_height,
            chain_id: window.chain_id,
            genesis_snapshot: None,
            genesis: None,
        };
        if !state.in_progress {
            return Ok(metadata);
        }

        metadata.in_migration = true;
        metadata.genesis_snapshot = self.snapshots.snapshot_at(window.start_height).await;
        metadata.genesis = self.load_genesis().await?;
        Ok(metadata)
    }

    /// Chunk of the genesis snapshot, which exists only at the window start
    pub async fn genesis_snapshot_chunk(
        &self,
        height: u64,
        format: u32,
        index: u32,
    ) -> Result<Vec<u8>, MigrationError> {
        let window = self.require_window().await?;
        if height != window.start_height {
            return Err(SnapshotError::NotFound { height }.into());
        }
        Ok(self
            .snapshots
            .load_snapshot_chunk(height, format, index)
            .await?)
    }

    pub async fn changeset_metadata(&self, height: u64) -> Result<ChangesetMetadata, MigrationError> {
        self.check_recorded(height).await?;
        self.changesets.metadata(height).await
    }

    pub async fn changeset_chunk(&self, height: u64, index: u32) -> Result<Vec<u8>, MigrationError> {
        self.check_recorded(height).await?;
        self.changesets.load_chunk(height, index).await
    }

    async fn require_window(&self) -> Result<MigrationWindow, MigrationError> {
        self.state
            .lock()
            .await
            .window
            .clone()
            .ok_or(MigrationError::NoActiveMigration)
    }

    async fn check_recorded(&self, height: u64) -> Result<(), MigrationError> {
        let state = self.state.lock().await;
        let window = state.window.as_ref().ok_or(MigrationError::NoActiveMigration)?;
        if height < window.start_height || height > window.end_height {
            return Err(MigrationError::HeightOutOfWindow {
                height,
                start: window.start_height,
                end: window.end_height,
            });
        }
        match state.last_changeset_height {
            Some(last) if height <= last => Ok(()),
            _ => Err(MigrationError::NotRecorded { height }),
        }
    }

    /// Dumps the state at the window start through a pinned view and records
    /// the genesis parameters. Skipped when a previous run already did it.
    async fn create_genesis(&self, window: &MigrationWindow) -> Result<(), MigrationError> {
        let height = window.start_height;
        if self.snapshots.snapshot_at(height).await.is_some() && self.load_genesis().await?.is_some() {
            debug!("Genesis snapshot at height {} already exists", height);
            return Ok(());
        }

        info!("Creating genesis snapshot at height {}", height);
        let tx = self.db.begin_snapshot_tx().await?;
        let result = self.snapshots.create_snapshot(height, tx.snapshot_id()).await;
        tx.rollback().await;
        let snapshot = result?;

        let genesis = GenesisInfo {
            chain_id: window.chain_id.clone(),
            start_height: window.start_height,
            end_height: window.end_height,
            snapshot_hash: snapshot.snapshot_hash,
        };
        let path = self.dir.join(GENESIS_FILE);
        write_json(&path, &genesis).await?;

        info!(
            "✓ Genesis snapshot at height {} created ({} chunks, hash {})",
            height,
            snapshot.chunk_count,
            hex::encode(snapshot.snapshot_hash)
        );
        Ok(())
    }

    async fn load_genesis(&self) -> Result<Option<GenesisInfo>, MigrationError> {
        let path = self.dir.join(GENESIS_FILE);
        match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)
                .map(Some)
                .map_err(|e| MigrationError::io(&path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MigrationError::io(&path, e)),
        }
    }

    async fn persist(&self, state: &MigrationState) -> Result<(), MigrationError> {
        write_json(&self.dir.join(STATE_FILE), state).await
    }
}

/// Resolution of a confirmed `migration_declaration` vote; the payload is the
/// JSON-encoded window
#[async_trait]
impl ResolutionHandler for Migrator {
    async fn resolve(&self, payload: &[u8], block: &mut BlockContext) -> Result<(), SyncError> {
        let window: MigrationWindow = serde_json::from_slice(payload).map_err(|e| {
            MigrationError::InvalidWindow {
                reason: format!("malformed declaration: {}", e),
            }
        })?;
        self.declare_migration(window, block.height).await?;
        Ok(())
    }
}

#[async_trait]
impl EndBlockHook for Migrator {
    fn name(&self) -> &str {
        "migrator"
    }

    async fn end_block(&self, block: &mut BlockContext) -> Result<(), SyncError> {
        let entries = block.changeset.clone();
        self.notify_height(block, &entries).await?;
        Ok(())
    }
}

async fn load_state(path: &Path) -> Result<MigrationState, MigrationError> {
    match tokio::fs::read(path).await {
        Ok(content) => serde_json::from_slice(&content).map_err(|e| MigrationError::io(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MigrationState::default()),
        Err(e) => Err(MigrationError::io(path, e)),
    }
}

/// Write-then-rename so a crash never leaves a torn file
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MigrationError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| MigrationError::io(path, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| MigrationError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| MigrationError::io(path, e))
}
