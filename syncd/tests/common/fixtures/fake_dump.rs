//! Scripted stand-in for pg_dump/psql

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};

use syncd::errors::SnapshotError;
use syncd::snapshot::{DumpRequest, DumpTool, RestoreSink};

/// A small dump with a preamble, comments and unsorted COPY rows
pub const SAMPLE_DUMP: &str = "--\n\
-- PostgreSQL database dump\n\
--\n\
SET statement_timeout = 0;\n\
SELECT pg_catalog.set_config('search_path', '', false);\n\
\n\
CREATE SCHEMA kwild_accts;\n\
CREATE TABLE kwild_accts.accounts (identifier bytea, balance bigint);\n\
COPY kwild_accts.accounts (identifier, balance) FROM stdin;\n\
\\\\x02\t20\n\
\\\\x01\t10\n\
\\\\x03\t30\n\
\\.\n";

/// The same content as `SAMPLE_DUMP` with rows emitted in another order
pub const SAMPLE_DUMP_REORDERED: &str = "--\n\
-- PostgreSQL database dump\n\
--\n\
SET statement_timeout = 0;\n\
SELECT pg_catalog.set_config('search_path', '', false);\n\
\n\
CREATE SCHEMA kwild_accts;\n\
CREATE TABLE kwild_accts.accounts (identifier bytea, balance bigint);\n\
COPY kwild_accts.accounts (identifier, balance) FROM stdin;\n\
\\\\x03\t30\n\
\\\\x01\t10\n\
\\\\x02\t20\n\
\\.\n";

/// Writes a fixed script as the dump and records restored bytes
#[derive(Clone)]
pub struct FakeDumpTool {
    script: Arc<Mutex<Vec<u8>>>,
    pub requests: Arc<Mutex<Vec<DumpRequest>>>,
    pub restored: Arc<Mutex<Vec<u8>>>,
    pub finished: Arc<Mutex<bool>>,
}

impl FakeDumpTool {
    pub fn new(script: &str) -> Self {
        Self::with_bytes(script.as_bytes().to_vec())
    }

    pub fn with_bytes(script: Vec<u8>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            requests: Arc::new(Mutex::new(Vec::new())),
            restored: Arc::new(Mutex::new(Vec::new())),
            finished: Arc::new(Mutex::new(false)),
        }
    }

    pub fn set_script(&self, script: &str) {
        *self.script.lock().unwrap() = script.as_bytes().to_vec();
    }

    pub fn restored_text(&self) -> String {
        String::from_utf8_lossy(&self.restored.lock().unwrap()).into_owned()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap()
    }
}

#[async_trait]
impl DumpTool for FakeDumpTool {
    async fn dump(&self, request: &DumpRequest, output: &Path) -> Result<(), SnapshotError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.script.lock().unwrap().clone();
        tokio::fs::write(output, script)
            .await
            .map_err(|e| SnapshotError::io(output, e))
    }

    async fn begin_restore(&self) -> Result<Box<dyn RestoreSink>, SnapshotError> {
        self.restored.lock().unwrap().clear();
        *self.finished.lock().unwrap() = false;
        Ok(Box::new(FakeSink {
            restored: self.restored.clone(),
            finished: self.finished.clone(),
        }))
    }
}

struct FakeSink {
    restored: Arc<Mutex<Vec<u8>>>,
    finished: Arc<Mutex<bool>>,
}

#[async_trait]
impl RestoreSink for FakeSink {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        self.restored.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), SnapshotError> {
        *self.finished.lock().unwrap() = true;
        Ok(())
    }
}
