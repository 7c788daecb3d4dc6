use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, instrument, warn};

use super::dump::{DumpRequest, DumpTool};
use super::sanitize::{sanitize_dump, HashingWriter, SanitizedDump};
use super::types::{chunk_file_name, format_dir, height_dir, Hash, Snapshot};
use crate::constants::snapshot::{
    CHUNKS_DIR, DEFAULT_FORMAT, HEADER_FILE, STAGE1_DUMP_FILE, STAGE2_SANITIZED_FILE,
    STAGE3_COMPRESSED_FILE,
};
use crate::errors::SnapshotError;

/// Produces deterministic, chunked snapshots under `snapshot_dir`
pub struct Snapshotter {
    snapshot_dir: PathBuf,
    dump_tool: Arc<dyn DumpTool>,
    chunk_size: u64,
    max_row_size: usize,
}

impl Snapshotter {
    pub fn new(
        snapshot_dir: impl Into<PathBuf>,
        dump_tool: Arc<dyn DumpTool>,
        chunk_size: u64,
        max_row_size: usize,
    ) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            dump_tool,
            chunk_size: chunk_size.max(1),
            max_row_size,
        }
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Dumps, sanitizes, compresses and chunks the database at `height`.
    ///
    /// `snapshot_id` must name a consistent view held open by the caller.
    /// On any failure, or if this future is dropped, the height directory is
    /// removed so no partial snapshot is left behind.
    #[instrument(skip(self, schemas, exclude_tables, exclude_table_data))]
    pub async fn create_snapshot(
        &self,
        height: u64,
        snapshot_id: &str,
        schemas: &[String],
        exclude_tables: &[String],
        exclude_table_data: &[String],
    ) -> Result<Snapshot, SnapshotError> {
        let mut guard = DirGuard::new(height_dir(&self.snapshot_dir, height));
        let format = DEFAULT_FORMAT;
        let work_dir = format_dir(&self.snapshot_dir, height, format);

        if guard.path.exists() {
            warn!("Removing stale snapshot directory {}", guard.path.display());
            tokio::fs::remove_dir_all(&guard.path)
                .await
                .map_err(|e| SnapshotError::io(&guard.path, e))?;
        }
        tokio::fs::create_dir_all(work_dir.join(CHUNKS_DIR))
            .await
            .map_err(|e| SnapshotError::io(&work_dir, e))?;

        // Stage 1: logical dump bound to the caller's view
        let stage1 = work_dir.join(STAGE1_DUMP_FILE);
        let request = DumpRequest {
            snapshot_id: snapshot_id.to_string(),
            schemas: schemas.to_vec(),
            exclude_tables: exclude_tables.to_vec(),
            exclude_table_data: exclude_table_data.to_vec(),
        };
        self.dump_tool.dump(&request, &stage1).await?;

        // Stage 2: sanitize and hash
        let stage2 = work_dir.join(STAGE2_SANITIZED_FILE);
        let max_row_size = self.max_row_size;
        let sanitized = guard.stage({
            let (stage1, stage2) = (stage1.clone(), stage2.clone());
            move || {
                let sanitized = sanitize_dump(&stage1, &stage2, max_row_size)?;
                fs::remove_file(&stage1).map_err(|e| SnapshotError::io(&stage1, e))?;
                Ok(sanitized)
            }
        })
        .await?;
        info!(
            "Sanitized dump at height {}: {} bytes, hash {}",
            height,
            sanitized.size,
            hex::encode(sanitized.hash)
        );

        // Stage 3: gzip
        let stage3 = work_dir.join(STAGE3_COMPRESSED_FILE);
        let compressed_size = guard.stage({
            let (stage2, stage3) = (stage2.clone(), stage3.clone());
            move || {
                let size = compress_file(&stage2, &stage3)?;
                fs::remove_file(&stage2).map_err(|e| SnapshotError::io(&stage2, e))?;
                Ok(size)
            }
        })
        .await?;

        // Stage 4: chunk and write the header
        let chunk_size = self.chunk_size;
        let snapshot = guard.stage({
            let work_dir = work_dir.clone();
            move || {
                let chunk_hashes = split_into_chunks(
                    &stage3,
                    &work_dir.join(CHUNKS_DIR),
                    chunk_size,
                    compressed_size,
                )?;
                fs::remove_file(&stage3).map_err(|e| SnapshotError::io(&stage3, e))?;

                let snapshot = build_header(height, format, chunk_hashes, sanitized, compressed_size);
                write_header(&work_dir.join(HEADER_FILE), &snapshot)?;
                Ok(snapshot)
            }
        })
        .await?;

        guard.disarm();
        info!(
            "✓ Snapshot created at height {}: {} chunks, {} bytes",
            height, snapshot.chunk_count, snapshot.snapshot_size
        );
        Ok(snapshot)
    }
}

fn build_header(
    height: u64,
    format: u32,
    chunk_hashes: Vec<Hash>,
    sanitized: SanitizedDump,
    compressed_size: u64,
) -> Snapshot {
    Snapshot {
        height,
        format,
        chunk_count: chunk_hashes.len() as u32,
        chunk_hashes,
        snapshot_hash: sanitized.hash,
        snapshot_size: compressed_size,
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, SnapshotError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SnapshotError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| SnapshotError::ToolFailed {
            tool: "snapshot worker".to_string(),
            reason: e.to_string(),
        })?
}

/// Gzips `input` into `output`, returning the compressed size
pub fn compress_file(input: &Path, output: &Path) -> Result<u64, SnapshotError> {
    let mut reader = BufReader::new(File::open(input).map_err(|e| SnapshotError::io(input, e))?);
    let out = File::create(output).map_err(|e| SnapshotError::io(output, e))?;

    // Default header: no file name, zero mtime, so output depends only on input
    let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
    io::copy(&mut reader, &mut encoder).map_err(|e| SnapshotError::io(output, e))?;
    let mut writer = encoder.finish().map_err(|e| SnapshotError::io(output, e))?;
    writer.flush().map_err(|e| SnapshotError::io(output, e))?;

    let size = fs::metadata(output)
        .map_err(|e| SnapshotError::io(output, e))?
        .len();
    Ok(size)
}

/// Splits `input` into `chunk-<i>.sql.gz` files of `chunk_size` bytes (last one shorter)
pub fn split_into_chunks(
    input: &Path,
    chunks_dir: &Path,
    chunk_size: u64,
    expected_size: u64,
) -> Result<Vec<Hash>, SnapshotError> {
    let mut reader = BufReader::new(File::open(input).map_err(|e| SnapshotError::io(input, e))?);
    let chunk_count = expected_size.div_ceil(chunk_size);
    let mut hashes = Vec::with_capacity(chunk_count as usize);
    let mut total = 0u64;

    for index in 0..chunk_count {
        let path = chunks_dir.join(chunk_file_name(index as u32));
        let file = File::create(&path).map_err(|e| SnapshotError::io(&path, e))?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        let copied = io::copy(&mut (&mut reader).take(chunk_size), &mut writer)
            .map_err(|e| SnapshotError::io(&path, e))?;
        writer.flush().map_err(|e| SnapshotError::io(&path, e))?;

        let chunk = writer.finish();
        debug_assert_eq!(chunk.size, copied);
        total += copied;
        hashes.push(chunk.hash);
    }

    // Anything left means the file grew under us
    let mut trailing = [0u8; 1];
    let extra = reader
        .read(&mut trailing)
        .map_err(|e| SnapshotError::io(input, e))?;

    if total != expected_size || extra != 0 {
        error!(
            "Chunked {} bytes but compressed snapshot is {} bytes",
            total, expected_size
        );
        return Err(SnapshotError::SizeMismatch {
            expected: expected_size,
            actual: total + extra as u64,
        });
    }

    Ok(hashes)
}

fn write_header(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(|e| SnapshotError::InvalidHeader {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    fs::write(path, json).map_err(|e| SnapshotError::io(path, e))
}

/// Removes a height directory on drop unless disarmed.
///
/// Blocking stages hold `stage_lock` while they touch the directory. Cleanup
/// takes the same lock, so a stage still running when the future is dropped
/// finishes before the directory goes away, and stages that start afterwards
/// see `cancelled` and write nothing.
struct DirGuard {
    path: PathBuf,
    armed: bool,
    cancelled: Arc<AtomicBool>,
    stage_lock: Arc<Mutex<()>>,
}

impl DirGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: true,
            cancelled: Arc::new(AtomicBool::new(false)),
            stage_lock: Arc::new(Mutex::new(())),
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Runs `task` on the blocking pool under the stage lock
    fn stage<T, F>(&self, task: F) -> impl Future<Output = Result<T, SnapshotError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, SnapshotError> + Send + 'static,
    {
        let path = self.path.clone();
        let cancelled = self.cancelled.clone();
        let stage_lock = self.stage_lock.clone();
        run_blocking(move || {
            let _stage = stage_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if cancelled.load(Ordering::SeqCst) {
                return Err(SnapshotError::io(&path, "snapshot creation cancelled"));
            }
            task()
        })
    }
}

fn remove_incomplete(path: &Path) {
    if path.exists() {
        warn!("Snapshot creation did not complete, removing {}", path.display());
        if let Err(e) = fs::remove_dir_all(path) {
            error!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);

        if let Ok(_idle) = self.stage_lock.try_lock() {
            remove_incomplete(&self.path);
            return;
        }

        // A stage is still writing: clean up once it releases the lock
        let path = self.path.clone();
        let stage_lock = self.stage_lock.clone();
        let cleanup = move || {
            let _stage = stage_lock.lock().unwrap_or_else(PoisonError::into_inner);
            remove_incomplete(&path);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(cleanup);
            }
            Err(_) => cleanup(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::types::sha256;

    #[test]
    fn chunks_cover_the_file_without_empty_tail() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.gz");
        let bytes: Vec<u8> = (0..100u8).collect();
        fs::write(&input, &bytes).unwrap();
        let chunks = dir.path().join("chunks");
        fs::create_dir(&chunks).unwrap();

        let hashes = split_into_chunks(&input, &chunks, 40, 100).unwrap();
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0], sha256(&bytes[0..40]));
        assert_eq!(hashes[2], sha256(&bytes[80..100]));
        assert!(!chunks.join("chunk-3.sql.gz").exists());

        let exact = split_into_chunks(&input, &chunks, 50, 100).unwrap();
        assert_eq!(exact.len(), 2);
    }

    #[test]
    fn size_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.gz");
        fs::write(&input, [1u8; 10]).unwrap();

        let err = split_into_chunks(&input, dir.path(), 4, 8).unwrap_err();
        assert!(matches!(err, SnapshotError::SizeMismatch { expected: 8, .. }));
    }

    #[test]
    fn compression_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.sql");
        fs::write(&input, b"CREATE TABLE t (x int);\n".repeat(100)).unwrap();

        let a = dir.path().join("a.gz");
        let b = dir.path().join("b.gz");
        compress_file(&input, &a).unwrap();
        compress_file(&input, &b).unwrap();
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cleanup_waits_for_a_running_stage() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("block-1");
        fs::create_dir_all(&target).unwrap();
        let guard = DirGuard::new(target.clone());

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let late_file = target.join("stage2output.sql");
        let stage = tokio::spawn(guard.stage({
            let late_file = late_file.clone();
            move || {
                started_tx.send(()).ok();
                release_rx.recv().ok();
                fs::write(&late_file, b"late").map_err(|e| SnapshotError::io(&late_file, e))
            }
        }));
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        drop(guard);
        assert!(target.exists());

        release_tx.send(()).unwrap();
        stage.await.unwrap().unwrap();
        for _ in 0..200 {
            if !target.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn stages_started_after_cancellation_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("block-2");
        fs::create_dir_all(&target).unwrap();
        let guard = DirGuard::new(target.clone());

        let pending = guard.stage({
            let target = target.clone();
            move || {
                fs::create_dir_all(&target).map_err(|e| SnapshotError::io(&target, e))?;
                fs::write(target.join("chunk-0.sql.gz"), b"x")
                    .map_err(|e| SnapshotError::io(&target, e))
            }
        });
        drop(guard);

        assert!(!target.exists());
        assert!(pending.await.is_err());
        assert!(!target.exists());
    }
}
