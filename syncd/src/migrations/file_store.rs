use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::changeset::METADATA_FILE;
use crate::errors::MigrationError;

/// Chunk layout of one stored changeset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetMetadata {
    pub height: u64,
    pub chunks: u32,
    pub chunk_sizes: Vec<u64>,
}

impl ChangesetMetadata {
    pub fn total_size(&self) -> u64 {
        self.chunk_sizes.iter().sum()
    }
}

/// Height-indexed changeset files kept by a source node:
/// `block-<h>/metadata.json` and `block-<h>/chunks/changeset-<i>`
pub struct ChangesetFileStore {
    dir: PathBuf,
    chunk_size: u64,
}

impl ChangesetFileStore {
    pub fn new(dir: impl Into<PathBuf>, chunk_size: u64) -> Self {
        Self {
            dir: dir.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn height_dir(&self, height: u64) -> PathBuf {
        self.dir.join(format!("block-{}", height))
    }

    fn chunk_path(&self, height: u64, index: u32) -> PathBuf {
        self.height_dir(height)
            .join("chunks")
            .join(format!("changeset-{}", index))
    }

    /// Writes the changeset for `height`, replacing anything stored before.
    /// The metadata file goes last so a partially written height is never
    /// reported as recorded.
    pub async fn store(&self, height: u64, data: &[u8]) -> Result<ChangesetMetadata, MigrationError> {
        let height_dir = self.height_dir(height);
        if let Err(e) = tokio::fs::remove_dir_all(&height_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(MigrationError::io(&height_dir, e));
            }
        }

        let chunks_dir = height_dir.join("chunks");
        tokio::fs::create_dir_all(&chunks_dir)
            .await
            .map_err(|e| MigrationError::io(&chunks_dir, e))?;

        let mut chunk_sizes = Vec::new();
        for (index, chunk) in data.chunks(self.chunk_size as usize).enumerate() {
            let path = self.chunk_path(height, index as u32);
            tokio::fs::write(&path, chunk)
                .await
                .map_err(|e| MigrationError::io(&path, e))?;
            chunk_sizes.push(chunk.len() as u64);
        }

        let metadata = ChangesetMetadata {
            height,
            chunks: chunk_sizes.len() as u32,
            chunk_sizes,
        };
        let path = height_dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(&metadata).map_err(|e| MigrationError::io(&path, e))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| MigrationError::io(&path, e))?;

        debug!(
            "Stored changeset for height {} ({} bytes in {} chunks)",
            height,
            data.len(),
            metadata.chunks
        );
        Ok(metadata)
    }

    pub async fn metadata(&self, height: u64) -> Result<ChangesetMetadata, MigrationError> {
        let path = self.height_dir(height).join(METADATA_FILE);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigrationError::NotRecorded { height })
            }
            Err(e) => return Err(MigrationError::io(&path, e)),
        };
        serde_json::from_slice(&content).map_err(|e| MigrationError::io(&path, e))
    }

    pub async fn load_chunk(&self, height: u64, index: u32) -> Result<Vec<u8>, MigrationError> {
        let metadata = self.metadata(height).await?;
        if index >= metadata.chunks {
            return Err(MigrationError::ChunkOutOfRange {
                height,
                index,
                count: metadata.chunks,
            });
        }
        let path = self.chunk_path(height, index);
        tokio::fs::read(&path)
            .await
            .map_err(|e| MigrationError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn splits_and_reloads_changesets() {
        let dir = TempDir::new().unwrap();
        let store = ChangesetFileStore::new(dir.path(), 4);

        let metadata = store.store(7, b"0123456789").await.unwrap();
        assert_eq!(metadata.chunks, 3);
        assert_eq!(metadata.chunk_sizes, vec![4, 4, 2]);
        assert_eq!(store.metadata(7).await.unwrap(), metadata);

        let mut joined = Vec::new();
        for i in 0..metadata.chunks {
            joined.extend(store.load_chunk(7, i).await.unwrap());
        }
        assert_eq!(joined, b"0123456789");
        assert!(store.load_chunk(7, 3).await.is_err());
    }

    #[tokio::test]
    async fn empty_changeset_has_no_chunks() {
        let dir = TempDir::new().unwrap();
        let store = ChangesetFileStore::new(dir.path(), 4);

        let metadata = store.store(3, &[]).await.unwrap();
        assert_eq!(metadata.chunks, 0);
        assert!(matches!(
            store.metadata(4).await,
            Err(MigrationError::NotRecorded { height: 4 })
        ));
    }
}
