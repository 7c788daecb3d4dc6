//! Native dump and restore tools.
//!
//! `PgDumpTool` drives `pg_dump` and `psql` as child processes. Children are
//! spawned with `kill_on_drop`, so dropping an in-flight dump or restore
//! (shutdown, aborted sync) terminates the tool.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as AsyncCommand};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::errors::SnapshotError;

/// What to include in a logical dump, bound to a consistent view
#[derive(Debug, Clone, Default)]
pub struct DumpRequest {
    pub snapshot_id: String,
    pub schemas: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub exclude_table_data: Vec<String>,
}

/// Receives the decompressed dump during a restore
#[async_trait]
pub trait RestoreSink: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), SnapshotError>;

    /// Closes the input and waits for the restore to complete
    async fn finish(self: Box<Self>) -> Result<(), SnapshotError>;
}

#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Writes a plain-text logical dump to `output`
    async fn dump(&self, request: &DumpRequest, output: &Path) -> Result<(), SnapshotError>;

    async fn begin_restore(&self) -> Result<Box<dyn RestoreSink>, SnapshotError>;
}

#[derive(Debug, Clone)]
pub struct PgDumpTool {
    pg_dump_path: String,
    psql_path: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    dbname: String,
}

impl PgDumpTool {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            pg_dump_path: config.pg_dump_path.clone(),
            psql_path: config.psql_path.clone(),
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            dbname: config.dbname.clone(),
        }
    }

    /// Argument list for `pg_dump`, in a stable order
    pub fn dump_args(&self, request: &DumpRequest, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--file".into(),
            output.display().to_string(),
            "--format".into(),
            "plain".into(),
            "--dbname".into(),
            self.dbname.clone(),
            "-U".into(),
            self.user.clone(),
            "-h".into(),
            self.host.clone(),
            "-p".into(),
            self.port.to_string(),
            "--no-password".into(),
        ];

        if !request.snapshot_id.is_empty() {
            args.push("--snapshot".into());
            args.push(request.snapshot_id.clone());
        }

        for flag in [
            "--no-unlogged-table-data",
            "--no-comments",
            "--create",
            "--no-publications",
            "--no-tablespaces",
            "--no-table-access-method",
            "--no-security-labels",
            "--no-subscriptions",
            "--large-objects",
            "--no-owner",
        ] {
            args.push(flag.into());
        }

        for schema in &request.schemas {
            args.push("--schema".into());
            args.push(schema.clone());
        }
        for table in &request.exclude_tables {
            args.push("-T".into());
            args.push(table.clone());
        }
        for table in &request.exclude_table_data {
            args.push("--exclude-table-data".into());
            args.push(table.clone());
        }

        args
    }

    pub fn restore_args(&self) -> Vec<String> {
        vec![
            "--username".into(),
            self.user.clone(),
            "--host".into(),
            self.host.clone(),
            "--port".into(),
            self.port.to_string(),
            "--dbname".into(),
            self.dbname.clone(),
            "--no-password".into(),
        ]
    }

    fn command(&self, program: &str, args: &[String]) -> AsyncCommand {
        let mut command = AsyncCommand::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.password.is_empty() {
            command.env("PGPASSWORD", &self.password);
        }
        command
    }
}

#[async_trait]
impl DumpTool for PgDumpTool {
    async fn dump(&self, request: &DumpRequest, output: &Path) -> Result<(), SnapshotError> {
        let args = self.dump_args(request, output);
        info!(
            "Starting pg_dump of {} schemas (snapshot {})",
            request.schemas.len(),
            request.snapshot_id
        );
        debug!("pg_dump args: {:?}", args);

        let mut child = self
            .command(&self.pg_dump_path, &args)
            .spawn()
            .map_err(|e| tool_failed("pg_dump", format!("failed to spawn: {}", e)))?;

        let drains = drain_output("pg_dump", &mut child);
        let status = child
            .wait()
            .await
            .map_err(|e| tool_failed("pg_dump", e))?;
        let stderr = join_drains(drains).await;

        if !status.success() {
            return Err(tool_failed(
                "pg_dump",
                format!("exit code {}: {}", status.code().unwrap_or(-1), stderr),
            ));
        }

        info!("✓ pg_dump completed: {}", output.display());
        Ok(())
    }

    async fn begin_restore(&self) -> Result<Box<dyn RestoreSink>, SnapshotError> {
        let args = self.restore_args();
        info!("Starting psql restore into database {}", self.dbname);

        let mut command = self.command(&self.psql_path, &args);
        command.stdin(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| tool_failed("psql", format!("failed to spawn: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| tool_failed("psql", "stdin not captured"))?;
        let drains = drain_output("psql", &mut child);

        Ok(Box::new(PsqlRestore {
            child,
            stdin: Some(stdin),
            drains,
        }))
    }
}

struct PsqlRestore {
    child: Child,
    stdin: Option<ChildStdin>,
    drains: Vec<JoinHandle<String>>,
}

#[async_trait]
impl RestoreSink for PsqlRestore {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| tool_failed("psql", "input already closed"))?;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| tool_failed("psql", format!("write failed: {}", e)))
    }

    async fn finish(mut self: Box<Self>) -> Result<(), SnapshotError> {
        // Closing stdin ends psql's input
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .shutdown()
                .await
                .map_err(|e| tool_failed("psql", e))?;
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| tool_failed("psql", e))?;
        let stderr = join_drains(std::mem::take(&mut self.drains)).await;

        if !status.success() {
            return Err(tool_failed(
                "psql",
                format!("exit code {}: {}", status.code().unwrap_or(-1), stderr),
            ));
        }
        info!("✓ psql restore completed");
        Ok(())
    }
}

fn tool_failed(tool: &str, reason: impl ToString) -> SnapshotError {
    SnapshotError::ToolFailed {
        tool: tool.to_string(),
        reason: reason.to_string(),
    }
}

/// Continuously drains stdout and stderr so the child never blocks on a full pipe.
/// The stderr task returns what it collected for error reporting.
fn drain_output(tool: &'static str, child: &mut Child) -> Vec<JoinHandle<String>> {
    let mut handles = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        handles.push(tokio::spawn(drain_lines(tool, "stdout", stdout, false)));
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(tokio::spawn(drain_lines(tool, "stderr", stderr, true)));
    }

    handles
}

async fn drain_lines<R>(tool: &'static str, stream: &'static str, reader: R, keep: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut collected = String::new();
    while let Ok(bytes_read) = reader.read_line(&mut line).await {
        if bytes_read == 0 {
            break;
        }
        debug!("{} {}: {}", tool, stream, line.trim());
        if keep && collected.len() < 4096 {
            collected.push_str(&line);
        }
        line.clear();
    }
    collected
}

async fn join_drains(handles: Vec<JoinHandle<String>>) -> String {
    let mut collected = String::new();
    for handle in handles {
        match handle.await {
            Ok(text) => collected.push_str(&text),
            Err(e) => warn!("Output drain task failed: {}", e),
        }
    }
    collected.trim().to_string()
}
