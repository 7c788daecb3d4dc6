use anyhow::anyhow;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument};

use super::backoff::BackoffPolicy;
use super::payload::ChangesetChunk;
use super::rpc_client::ChangesetSource;
use crate::config::ReplicatorConfig;
use crate::constants::events::CHANGESET_MIGRATION;
use crate::database::Database;
use crate::errors::ChangesetError;
use crate::voting::VoteBroadcaster;

const LAST_STORED_KEY: &str = "last_stored_height";
const LAST_EMITTED_KEY: &str = "last_emitted_height";

#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    pub start_height: u64,
    pub end_height: u64,
    /// Largest payload carried by one vote on the destination chain
    pub chunk_budget: u64,
    pub max_retries: u32,
    pub poll_interval: Duration,
}

impl From<&ReplicatorConfig> for ReplicatorSettings {
    fn from(config: &ReplicatorConfig) -> Self {
        Self {
            start_height: config.start_height,
            end_height: config.end_height,
            chunk_budget: config.chunk_budget(),
            max_retries: config.max_retries,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// What one replication step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightOutcome {
    /// Broadcast this many vote chunks for the height
    Emitted { height: u64, chunks: u64 },
    /// Height carried no data
    Skipped { height: u64 },
    /// Source has not recorded the height yet
    NotReady { height: u64 },
    /// Cursor is past the window end
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    next_height: u64,
    last_emitted: Option<u64>,
}

/// Pulls changesets from the source chain height by height and submits them
/// as `changeset_migration` votes
pub struct ChangesetReplicator {
    settings: ReplicatorSettings,
    source: Arc<dyn ChangesetSource>,
    broadcaster: Arc<dyn VoteBroadcaster>,
    db: Database,
    backoff: BackoffPolicy,
    cursor: Mutex<Cursor>,
}

impl ChangesetReplicator {
    /// Resumes from the persisted cursor, or starts at the window start
    pub async fn new(
        settings: ReplicatorSettings,
        source: Arc<dyn ChangesetSource>,
        broadcaster: Arc<dyn VoteBroadcaster>,
        db: Database,
    ) -> Result<Self, ChangesetError> {
        let last_stored = db.replicator_value(LAST_STORED_KEY).await?;
        let last_emitted = db.replicator_value(LAST_EMITTED_KEY).await?;
        let next_height = match last_stored {
            Some(last) => settings.start_height.max(last + 1),
            None => settings.start_height,
        };

        info!(
            "Changeset replicator from {} starting at height {} (window {}..={})",
            source.name(),
            next_height,
            settings.start_height,
            settings.end_height
        );

        Ok(Self {
            settings,
            source,
            broadcaster,
            db,
            backoff: BackoffPolicy::default(),
            cursor: Mutex::new(Cursor {
                next_height,
                last_emitted,
            }),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn next_height(&self) -> u64 {
        self.cursor.lock().await.next_height
    }

    pub async fn last_emitted(&self) -> Option<u64> {
        self.cursor.lock().await.last_emitted
    }

    /// Replicates until the window end is passed or shutdown is signalled.
    /// Exhausted retries stop the replicator with an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ChangesetError> {
        loop {
            let outcome = tokio::select! {
                outcome = self.replicate_next() => outcome?,
                _ = shutdown.changed() => {
                    info!("Changeset replicator stopping");
                    return Ok(());
                }
            };

            if outcome == HeightOutcome::Finished {
                info!("✓ All changesets up to height {} replicated", self.settings.end_height);
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("Changeset replicator stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Processes the height under the cursor. The cursor only moves after
    /// every chunk of the height was broadcast.
    #[instrument(skip(self))]
    pub async fn replicate_next(&self) -> Result<HeightOutcome, ChangesetError> {
        let mut cursor = self.cursor.lock().await;
        let height = cursor.next_height;
        if height > self.settings.end_height {
            return Ok(HeightOutcome::Finished);
        }

        // The source halts at the end height without recording it
        if height == self.settings.end_height {
            let sentinel = ChangesetChunk::sentinel(height, cursor.last_emitted);
            self.broadcast(&sentinel).await?;
            info!("Broadcast end-of-migration marker at height {}", height);
            self.advance(&mut cursor, height, true).await?;
            return Ok(HeightOutcome::Emitted { height, chunks: 1 });
        }

        let metadata = self
            .backoff
            .retry(
                &format!("changeset metadata at height {}", height),
                self.settings.max_retries,
                || self.source.changeset_metadata(height),
            )
            .await?;
        let Some(metadata) = metadata else {
            debug!("Height {} not recorded by the source yet", height);
            return Ok(HeightOutcome::NotReady { height });
        };

        if metadata.chunk_sizes.len() != metadata.chunks as usize {
            return Err(ChangesetError::Transport {
                reason: format!(
                    "metadata for height {} lists {} sizes for {} chunks",
                    height,
                    metadata.chunk_sizes.len(),
                    metadata.chunks
                ),
            });
        }

        debug!(
            "Changeset metadata for height {}: {} chunks, {} bytes",
            height,
            metadata.chunks,
            metadata.total_size()
        );

        let fetches = metadata
            .chunk_sizes
            .iter()
            .enumerate()
            .map(|(index, size)| self.fetch_chunk(height, index as u32, *size));
        let data: Vec<u8> = try_join_all(fetches).await?.concat();

        if data.is_empty() {
            debug!("Empty changeset at height {}, skipping", height);
            self.advance(&mut cursor, height, false).await?;
            return Ok(HeightOutcome::Skipped { height });
        }

        let budget = self.settings.chunk_budget.max(1) as usize;
        let total_chunks = data.len().div_ceil(budget) as u64;
        for (index, payload) in data.chunks(budget).enumerate() {
            let chunk = ChangesetChunk {
                height,
                chunk_idx: index as u64,
                total_chunks,
                payload: payload.to_vec(),
                previous_height_with_data: cursor.last_emitted,
            };
            self.broadcast(&chunk).await?;
        }

        info!(
            "Broadcast changeset for height {} ({} bytes in {} votes)",
            height,
            data.len(),
            total_chunks
        );
        self.advance(&mut cursor, height, true).await?;
        Ok(HeightOutcome::Emitted {
            height,
            chunks: total_chunks,
        })
    }

    async fn fetch_chunk(&self, height: u64, index: u32, expected: u64) -> Result<Vec<u8>, ChangesetError> {
        self.backoff
            .retry(
                &format!("changeset chunk {} at height {}", index, height),
                self.settings.max_retries,
                move || async move {
                    let bytes = self.source.changeset_chunk(height, index).await?;
                    if bytes.len() as u64 != expected {
                        return Err(anyhow!(ChangesetError::SizeMismatch {
                            height,
                            index,
                            expected,
                            actual: bytes.len() as u64,
                        }));
                    }
                    Ok(bytes)
                },
            )
            .await
    }

    async fn broadcast(&self, chunk: &ChangesetChunk) -> Result<(), ChangesetError> {
        self.broadcaster
            .broadcast(CHANGESET_MIGRATION, chunk.encode())
            .await
            .map_err(|e| ChangesetError::Transport {
                reason: format!(
                    "broadcast of chunk {} at height {} failed: {}",
                    chunk.chunk_idx, chunk.height, e
                ),
            })
    }

    async fn advance(&self, cursor: &mut Cursor, height: u64, emitted: bool) -> Result<(), ChangesetError> {
        if emitted {
            self.db
                .set_replicator_values(&[(LAST_STORED_KEY, height), (LAST_EMITTED_KEY, height)])
                .await?;
            cursor.last_emitted = Some(height);
        } else {
            self.db
                .set_replicator_values(&[(LAST_STORED_KEY, height)])
                .await?;
        }
        cursor.next_height = height + 1;
        Ok(())
    }
}
