//! Dump sanitizer: turns an engine-specific plain dump into bytes that are
//! identical on every node holding the same logical content.
//!
//! - Blank and `--` comment lines are dropped
//! - `SET`, `SELECT`, `\connect` and `CREATE DATABASE` lines before the first
//!   `CREATE SCHEMA` / `CREATE TABLE` / `CREATE FUNCTION` are dropped
//! - Rows of every `COPY ... FROM stdin;` block are re-emitted ordered by the
//!   sha256 of their raw text
//!
//! Only `(hash, offset, len)` is kept per row; row bytes are read back from
//! the source by seeking once the block is sorted.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::types::Hash;
use crate::errors::SnapshotError;

const SCHEMA_STARTERS: [&[u8]; 3] = [b"CREATE SCHEMA", b"CREATE TABLE", b"CREATE FUNCTION"];
const PREAMBLE_STATEMENTS: [&[u8]; 4] = [b"SET", b"SELECT", b"\\connect", b"CREATE DATABASE"];

/// Result of sanitizing one dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizedDump {
    pub hash: Hash,
    pub size: u64,
}

struct HashedRow {
    hash: Hash,
    offset: u64,
    len: usize,
}

/// Sanitizes `input` into `output`, returning the hash of the written bytes
pub fn sanitize_dump(
    input: &Path,
    output: &Path,
    max_row_size: usize,
) -> Result<SanitizedDump, SnapshotError> {
    let reader = BufReader::new(File::open(input).map_err(|e| SnapshotError::io(input, e))?);
    let source = File::open(input).map_err(|e| SnapshotError::io(input, e))?;
    let out = File::create(output).map_err(|e| SnapshotError::io(output, e))?;

    let mut writer = HashingWriter::new(BufWriter::new(out));
    sanitize(reader, source, &mut writer, max_row_size)
        .map_err(|e| relabel(e, input))?;
    writer.flush().map_err(|e| SnapshotError::io(output, e))?;
    writer
        .inner
        .get_ref()
        .sync_all()
        .map_err(|e| SnapshotError::io(output, e))?;

    Ok(writer.finish())
}

/// Core of the sanitizer over any line source, seekable copy of the same bytes, and sink
pub fn sanitize<R, S, W>(
    mut reader: R,
    mut source: S,
    writer: &mut W,
    max_row_size: usize,
) -> Result<(), SnapshotError>
where
    R: BufRead,
    S: Read + Seek,
    W: Write,
{
    let mut in_copy_block = false;
    let mut schema_started = false;
    let mut rows: Vec<HashedRow> = Vec::new();
    let mut offset: u64 = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(max_row_size as u64 + 2)
            .read_until(b'\n', &mut buf)
            .map_err(io_error)?;
        if read == 0 {
            break;
        }
        let line_start = offset;
        offset += read as u64;

        let line = strip_line_ending(&buf);
        if line.len() > max_row_size {
            return Err(SnapshotError::RowTooLarge {
                size: line.len(),
                limit: max_row_size,
            });
        }
        let trimmed = line.trim_ascii();

        if in_copy_block {
            if trimmed == b"\\." {
                in_copy_block = false;
                rows.sort_by(|a, b| a.hash.cmp(&b.hash));
                emit_rows(&mut source, writer, &rows)?;
                rows.clear();
                write_line(writer, line)?;
            } else {
                rows.push(HashedRow {
                    hash: Sha256::digest(line).into(),
                    offset: line_start,
                    len: line.len(),
                });
            }
            continue;
        }

        if trimmed.is_empty() || trimmed.starts_with(b"--") {
            continue;
        }

        if !schema_started {
            if SCHEMA_STARTERS.iter().any(|p| trimmed.starts_with(p)) {
                schema_started = true;
            } else if PREAMBLE_STATEMENTS.iter().any(|p| trimmed.starts_with(p)) {
                continue;
            }
        }

        if trimmed.starts_with(b"COPY") && contains(trimmed, b"FROM stdin;") {
            in_copy_block = true;
        }
        write_line(writer, line)?;
    }

    if in_copy_block {
        return Err(SnapshotError::ToolFailed {
            tool: "sanitizer".to_string(),
            reason: "dump ended inside a COPY block".to_string(),
        });
    }

    Ok(())
}

fn emit_rows<S, W>(source: &mut S, writer: &mut W, rows: &[HashedRow]) -> Result<(), SnapshotError>
where
    S: Read + Seek,
    W: Write,
{
    let mut row = Vec::new();
    for entry in rows {
        row.resize(entry.len, 0);
        source
            .seek(SeekFrom::Start(entry.offset))
            .map_err(io_error)?;
        source.read_exact(&mut row).map_err(io_error)?;
        write_line(writer, &row)?;
    }
    Ok(())
}

fn write_line<W: Write>(writer: &mut W, line: &[u8]) -> Result<(), SnapshotError> {
    writer.write_all(line).map_err(io_error)?;
    writer.write_all(b"\n").map_err(io_error)
}

fn strip_line_ending(buf: &[u8]) -> &[u8] {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn io_error(e: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: String::new(),
        reason: e.to_string(),
    }
}

fn relabel(err: SnapshotError, path: &Path) -> SnapshotError {
    match err {
        SnapshotError::Io { path: p, reason } if p.is_empty() => SnapshotError::Io {
            path: path.display().to_string(),
            reason,
        },
        other => other,
    }
}

/// Writer that hashes and counts everything passing through
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn finish(self) -> SanitizedDump {
        SanitizedDump {
            hash: self.hasher.finalize().into(),
            size: self.written,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
