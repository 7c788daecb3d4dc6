//! Destination-side changeset tables, the applied watermark and replicator state.

use tracing::debug;

use super::{Database, DbTx, SqlValue};
use crate::errors::DatabaseError;

/// Metadata row for a height whose chunks are still being voted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHeight {
    pub height: u64,
    pub total_chunks: u64,
    pub received: u64,
    pub prev_height: Option<u64>,
}

impl PendingHeight {
    pub fn is_complete(&self) -> bool {
        self.received == self.total_chunks
    }

    fn from_row(row: &[SqlValue]) -> Result<Self, DatabaseError> {
        match row {
            [height, total, received, prev] => Ok(Self {
                height: height.as_u64()?,
                total_chunks: total.as_u64()?,
                received: received.as_u64()?,
                prev_height: prev.as_opt_u64()?,
            }),
            _ => Err(DatabaseError::UnexpectedValue {
                expected: "4 metadata columns".to_string(),
                found: format!("{} columns", row.len()),
            }),
        }
    }
}

impl DbTx {
    pub async fn changeset_metadata(
        &mut self,
        height: u64,
    ) -> Result<Option<PendingHeight>, DatabaseError> {
        let rows = self
            .query(
                "SELECT height, total_chunks, received, prev_height FROM changeset_metadata WHERE height = $1",
                &[height.into()],
            )
            .await?;
        rows.first().map(|row| PendingHeight::from_row(row)).transpose()
    }

    /// Lowest height that still has pending chunks
    pub async fn earliest_pending(&mut self) -> Result<Option<PendingHeight>, DatabaseError> {
        let rows = self
            .query(
                "SELECT height, total_chunks, received, prev_height FROM changeset_metadata ORDER BY height ASC LIMIT 1",
                &[],
            )
            .await?;
        rows.first().map(|row| PendingHeight::from_row(row)).transpose()
    }

    pub async fn insert_changeset_metadata(
        &mut self,
        height: u64,
        total_chunks: u64,
        prev_height: Option<u64>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "INSERT INTO changeset_metadata (height, total_chunks, received, prev_height) VALUES ($1, $2, 0, $3) ON CONFLICT (height) DO NOTHING",
            &[height.into(), total_chunks.into(), prev_height.into()],
        )
        .await?;
        Ok(())
    }

    /// Stores a chunk body and counts it; returns false when the chunk was already stored
    pub async fn insert_changeset_chunk(
        &mut self,
        height: u64,
        index: u64,
        data: &[u8],
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .execute(
                "INSERT INTO changeset_chunks (height, chunk_index, data) VALUES ($1, $2, $3) ON CONFLICT (height, chunk_index) DO NOTHING",
                &[height.into(), index.into(), data.to_vec().into()],
            )
            .await?;
        if inserted == 0 {
            debug!("Changeset chunk {} at height {} already stored", index, height);
            return Ok(false);
        }

        self.execute(
            "UPDATE changeset_metadata SET received = received + 1 WHERE height = $1",
            &[height.into()],
        )
        .await?;
        Ok(true)
    }

    /// Chunk bodies for a height, in index order
    pub async fn changeset_chunks(&mut self, height: u64) -> Result<Vec<Vec<u8>>, DatabaseError> {
        let rows = self
            .query(
                "SELECT data FROM changeset_chunks WHERE height = $1 ORDER BY chunk_index ASC",
                &[height.into()],
            )
            .await?;
        rows.iter()
            .map(|row| match row.first() {
                Some(value) => value.as_bytes().map(<[u8]>::to_vec),
                None => Err(DatabaseError::UnexpectedValue {
                    expected: "chunk data column".to_string(),
                    found: "empty row".to_string(),
                }),
            })
            .collect()
    }

    /// Removes a height's metadata; chunk bodies follow through the cascade
    pub async fn delete_changeset_height(&mut self, height: u64) -> Result<(), DatabaseError> {
        self.execute(
            "DELETE FROM changeset_metadata WHERE height = $1",
            &[height.into()],
        )
        .await?;
        Ok(())
    }

    pub async fn applied_watermark(&mut self) -> Result<Option<u64>, DatabaseError> {
        let rows = self
            .query("SELECT height FROM changeset_watermark WHERE id = 1", &[])
            .await?;
        match rows.first().and_then(|row| row.first()) {
            Some(value) => value.as_opt_u64(),
            None => Ok(None),
        }
    }

    pub async fn set_applied_watermark(&mut self, height: u64) -> Result<(), DatabaseError> {
        self.execute(
            "INSERT INTO changeset_watermark (id, height) VALUES (1, $1) ON CONFLICT (id) DO UPDATE SET height = excluded.height",
            &[height.into()],
        )
        .await?;
        Ok(())
    }
}

impl Database {
    pub async fn replicator_value(&self, key: &str) -> Result<Option<u64>, DatabaseError> {
        let mut tx = self.begin_tx().await?;
        let rows = tx
            .query(
                "SELECT value FROM replicator_state WHERE key = $1",
                &[key.into()],
            )
            .await?;
        tx.rollback().await;
        match rows.first().and_then(|row| row.first()) {
            Some(value) => value.as_u64().map(Some),
            None => Ok(None),
        }
    }

    /// Writes several replicator keys atomically
    pub async fn set_replicator_values(&self, values: &[(&str, u64)]) -> Result<(), DatabaseError> {
        let mut tx = self.begin_tx().await?;
        for (key, value) in values {
            tx.execute(
                "INSERT INTO replicator_state (key, value) VALUES ($1, $2) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                &[(*key).into(), (*value).into()],
            )
            .await?;
        }
        tx.commit().await
    }

    pub async fn applied_watermark(&self) -> Result<Option<u64>, DatabaseError> {
        let mut tx = self.begin_tx().await?;
        let watermark = tx.applied_watermark().await;
        tx.rollback().await;
        watermark
    }

    pub async fn pending_changeset(&self, height: u64) -> Result<Option<PendingHeight>, DatabaseError> {
        let mut tx = self.begin_tx().await?;
        let pending = tx.changeset_metadata(height).await;
        tx.rollback().await;
        pending
    }
}
