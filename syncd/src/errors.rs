//! Custom error types for the replication engine
//!
//! Every component reports failures through its own enum so callers can tell
//! protocol rejections apart from integrity failures, transient I/O and
//! invariant violations. Orchestration code (main, HTTP handlers, background
//! tasks) works with `anyhow::Result` and converts at the edges.

use std::fmt;
use std::path::Path;

/// Main error type for the replication engine
#[derive(Debug)]
pub enum SyncError {
    /// Configuration-related errors
    Config(ConfigError),

    /// Database boundary errors
    Database(DatabaseError),

    /// Snapshot creation, storage and serving errors
    Snapshot(SnapshotError),

    /// Snapshot bootstrap (state sync) errors
    StateSync(StateSyncError),

    /// Migration window errors on the source chain
    Migration(MigrationError),

    /// Changeset transport, decoding and replay errors
    Changeset(ChangesetError),

    /// Other errors with context
    Other(String),
}

/// Configuration error variants
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to load configuration file
    LoadFailed { path: String, reason: String },

    /// Invalid configuration value
    InvalidValue { field: String, reason: String },

    /// Missing required configuration
    MissingRequired { field: String },

    /// Configuration parsing error
    ParseError { reason: String },
}

/// Database error variants
#[derive(Debug)]
pub enum DatabaseError {
    /// Connection failed
    ConnectionFailed { reason: String },

    /// Query execution failed
    QueryFailed { query: String, reason: String },

    /// A stored value did not have the expected shape
    UnexpectedValue { expected: String, found: String },

    /// Column type outside the supported value set
    UnsupportedColumnType { column: String, type_name: String },

    /// Identifier rejected before being interpolated into SQL
    InvalidIdentifier { name: String },
}

/// Snapshot error variants
#[derive(Debug)]
pub enum SnapshotError {
    /// Filesystem failure on a snapshot artifact
    Io { path: String, reason: String },

    /// The native dump or restore tool failed
    ToolFailed { tool: String, reason: String },

    /// Dump line exceeded the sanitizer's row budget
    RowTooLarge { size: usize, limit: usize },

    /// Chunk sizes did not add up to the compressed file size
    SizeMismatch { expected: u64, actual: u64 },

    /// Header missing or malformed
    InvalidHeader { path: String, reason: String },

    /// No snapshot retained at this height
    NotFound { height: u64 },

    /// Requested format is not produced by this node
    UnsupportedFormat { format: u32 },

    /// Chunk index beyond the snapshot's chunk count
    ChunkOutOfRange { height: u64, index: u32, count: u32 },

    /// Failure while pinning the consistent read view
    Database(DatabaseError),
}

/// Snapshot bootstrap error variants
#[derive(Debug)]
pub enum StateSyncError {
    /// A snapshot is already being collected or restored
    AlreadyInProgress { height: u64 },

    /// Chunk delivered while no snapshot is being collected
    NotInProgress,

    /// Offered snapshot uses a format this node cannot restore
    UnsupportedFormat { format: u32 },

    /// Offered snapshot failed validation or provider cross-check
    InvalidSnapshot { reason: String },

    /// Chunk is malformed for this snapshot and must not be retried as-is
    RejectChunk { index: u32, reason: String },

    /// Chunk hash mismatch; the same index should be fetched again
    RefetchChunk { index: u32 },

    /// Chunk could not be persisted locally; retrying may succeed
    RetryChunk { index: u32, reason: String },

    /// Restored stream did not match the snapshot hash
    RejectSnapshot { reason: String },

    /// Restore could not be completed
    AbortSnapshot { reason: String },

    /// Bootstrap refused because the database already holds state
    DatabaseNotEmpty,

    /// Database boundary failure
    Database(DatabaseError),
}

/// Migration window error variants
#[derive(Debug)]
pub enum MigrationError {
    /// A window is already declared on this chain
    AlreadyActive { start_height: u64, end_height: u64 },

    /// Operation requires a declared window
    NoActiveMigration,

    /// Declared window is malformed
    InvalidWindow { reason: String },

    /// Deterministic halt at the window's end height
    NetworkHalted { chain_id: String },

    /// Height lies outside the declared window
    HeightOutOfWindow { height: u64, start: u64, end: u64 },

    /// No changeset has been recorded for this height yet
    NotRecorded { height: u64 },

    /// Chunk index beyond a stored changeset's chunk count
    ChunkOutOfRange { height: u64, index: u32, count: u32 },

    /// Filesystem failure on migration state
    Io { path: String, reason: String },

    /// Genesis snapshot creation failed
    Snapshot(SnapshotError),

    /// Database boundary failure
    Database(DatabaseError),
}

/// Changeset error variants
#[derive(Debug)]
pub enum ChangesetError {
    /// Malformed entry stream or vote payload
    Decode { reason: String },

    /// Entry type tag outside the known set
    UnknownEntryType { tag: u8 },

    /// Row change referenced a relation that was not declared first
    UnknownRelation { index: u32 },

    /// Chunk does not link to the applied watermark
    OutOfOrder {
        height: u64,
        previous: Option<u64>,
        watermark: Option<u64>,
    },

    /// Entry could not be replayed against the database
    Replay { reason: String },

    /// Bounded retries exhausted while talking to the source chain
    RetriesExhausted {
        operation: String,
        attempts: u32,
        reason: String,
    },

    /// Fetched chunk length differs from the declared size
    SizeMismatch {
        height: u64,
        index: u32,
        expected: u64,
        actual: u64,
    },

    /// Transport failure talking to the source chain
    Transport { reason: String },

    /// Database boundary failure
    Database(DatabaseError),
}

impl SnapshotError {
    pub fn io(path: &Path, err: impl fmt::Display) -> Self {
        SnapshotError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

impl MigrationError {
    pub fn io(path: &Path, err: impl fmt::Display) -> Self {
        MigrationError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

impl DatabaseError {
    pub fn query(query: &str, err: impl fmt::Display) -> Self {
        DatabaseError::QueryFailed {
            query: query.to_string(),
            reason: err.to_string(),
        }
    }
}

impl ChangesetError {
    pub fn decode(reason: impl Into<String>) -> Self {
        ChangesetError::Decode {
            reason: reason.into(),
        }
    }
}

// Implement Display for all error types
impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Config(e) => write!(f, "Configuration error: {}", e),
            SyncError::Database(e) => write!(f, "Database error: {}", e),
            SyncError::Snapshot(e) => write!(f, "Snapshot error: {}", e),
            SyncError::StateSync(e) => write!(f, "State sync error: {}", e),
            SyncError::Migration(e) => write!(f, "Migration error: {}", e),
            SyncError::Changeset(e) => write!(f, "Changeset error: {}", e),
            SyncError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LoadFailed { path, reason } => {
                write!(f, "Failed to load config from '{}': {}", path, reason)
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            ConfigError::MissingRequired { field } => {
                write!(f, "Missing required field: {}", field)
            }
            ConfigError::ParseError { reason } => {
                write!(f, "Failed to parse config: {}", reason)
            }
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::ConnectionFailed { reason } => {
                write!(f, "Database connection failed: {}", reason)
            }
            DatabaseError::QueryFailed { query, reason } => {
                write!(f, "Query '{}' failed: {}", query, reason)
            }
            DatabaseError::UnexpectedValue { expected, found } => {
                write!(f, "Expected {} value, found {}", expected, found)
            }
            DatabaseError::UnsupportedColumnType { column, type_name } => {
                write!(f, "Column '{}' has unsupported type {}", column, type_name)
            }
            DatabaseError::InvalidIdentifier { name } => {
                write!(f, "Invalid SQL identifier '{}'", name)
            }
        }
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Io { path, reason } => {
                write!(f, "I/O failure on '{}': {}", path, reason)
            }
            SnapshotError::ToolFailed { tool, reason } => {
                write!(f, "{} failed: {}", tool, reason)
            }
            SnapshotError::RowTooLarge { size, limit } => {
                write!(f, "Dump line of {} bytes exceeds limit of {} bytes", size, limit)
            }
            SnapshotError::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "Chunked size {} does not match compressed size {}",
                    actual, expected
                )
            }
            SnapshotError::InvalidHeader { path, reason } => {
                write!(f, "Invalid snapshot header '{}': {}", path, reason)
            }
            SnapshotError::NotFound { height } => {
                write!(f, "No snapshot at height {}", height)
            }
            SnapshotError::UnsupportedFormat { format } => {
                write!(f, "Unsupported snapshot format {}", format)
            }
            SnapshotError::ChunkOutOfRange {
                height,
                index,
                count,
            } => {
                write!(
                    f,
                    "Chunk {} out of range for snapshot at height {} ({} chunks)",
                    index, height, count
                )
            }
            SnapshotError::Database(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Display for StateSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateSyncError::AlreadyInProgress { height } => {
                write!(f, "State sync already in progress for height {}", height)
            }
            StateSyncError::NotInProgress => write!(f, "State sync not in progress"),
            StateSyncError::UnsupportedFormat { format } => {
                write!(f, "Unsupported snapshot format {}", format)
            }
            StateSyncError::InvalidSnapshot { reason } => {
                write!(f, "Invalid snapshot: {}", reason)
            }
            StateSyncError::RejectChunk { index, reason } => {
                write!(f, "Rejected snapshot chunk {}: {}", index, reason)
            }
            StateSyncError::RefetchChunk { index } => {
                write!(f, "Snapshot chunk {} hash mismatch, refetch required", index)
            }
            StateSyncError::RetryChunk { index, reason } => {
                write!(f, "Failed to store snapshot chunk {}: {}", index, reason)
            }
            StateSyncError::RejectSnapshot { reason } => {
                write!(f, "Snapshot rejected: {}", reason)
            }
            StateSyncError::AbortSnapshot { reason } => {
                write!(f, "Snapshot restore aborted: {}", reason)
            }
            StateSyncError::DatabaseNotEmpty => {
                write!(f, "Database is not empty, refusing to restore snapshot")
            }
            StateSyncError::Database(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::AlreadyActive {
                start_height,
                end_height,
            } => {
                write!(
                    f,
                    "Migration already declared for heights {}..={}",
                    start_height, end_height
                )
            }
            MigrationError::NoActiveMigration => write!(f, "No active migration"),
            MigrationError::InvalidWindow { reason } => {
                write!(f, "Invalid migration window: {}", reason)
            }
            MigrationError::NetworkHalted { chain_id } => {
                write!(
                    f,
                    "NETWORK HALTED: migration to chain \"{}\" has completed",
                    chain_id
                )
            }
            MigrationError::HeightOutOfWindow { height, start, end } => {
                write!(
                    f,
                    "Height {} is outside migration window {}..={}",
                    height, start, end
                )
            }
            MigrationError::NotRecorded { height } => {
                write!(f, "No changeset recorded for height {}", height)
            }
            MigrationError::ChunkOutOfRange {
                height,
                index,
                count,
            } => write!(
                f,
                "Changeset at height {} has {} chunks, requested chunk {}",
                height, count, index
            ),
            MigrationError::Io { path, reason } => {
                write!(f, "I/O failure on '{}': {}", path, reason)
            }
            MigrationError::Snapshot(e) => write!(f, "Genesis snapshot failed: {}", e),
            MigrationError::Database(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Display for ChangesetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangesetError::Decode { reason } => {
                write!(f, "Failed to decode changeset: {}", reason)
            }
            ChangesetError::UnknownEntryType { tag } => {
                write!(f, "Unknown changeset entry type 0x{:02x}", tag)
            }
            ChangesetError::UnknownRelation { index } => {
                write!(f, "Row change references undeclared relation {}", index)
            }
            ChangesetError::OutOfOrder {
                height,
                previous,
                watermark,
            } => {
                write!(
                    f,
                    "Changeset at height {} links to {:?} but last applied height is {:?}",
                    height, previous, watermark
                )
            }
            ChangesetError::Replay { reason } => {
                write!(f, "Failed to replay changeset: {}", reason)
            }
            ChangesetError::RetriesExhausted {
                operation,
                attempts,
                reason,
            } => {
                write!(
                    f,
                    "{} failed after {} attempts: {}",
                    operation, attempts, reason
                )
            }
            ChangesetError::SizeMismatch {
                height,
                index,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Changeset chunk {} at height {} has {} bytes, expected {}",
                    index, height, actual, expected
                )
            }
            ChangesetError::Transport { reason } => {
                write!(f, "Source chain request failed: {}", reason)
            }
            ChangesetError::Database(e) => write!(f, "{}", e),
        }
    }
}

// Implement std::error::Error
impl std::error::Error for SyncError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for DatabaseError {}
impl std::error::Error for SnapshotError {}
impl std::error::Error for StateSyncError {}
impl std::error::Error for MigrationError {}
impl std::error::Error for ChangesetError {}

// Conversions from anyhow::Error for gradual migration
impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Other(err.to_string())
    }
}

// Conversion helpers for sub-errors
impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err)
    }
}

impl From<DatabaseError> for SyncError {
    fn from(err: DatabaseError) -> Self {
        SyncError::Database(err)
    }
}

impl From<SnapshotError> for SyncError {
    fn from(err: SnapshotError) -> Self {
        SyncError::Snapshot(err)
    }
}

impl From<StateSyncError> for SyncError {
    fn from(err: StateSyncError) -> Self {
        SyncError::StateSync(err)
    }
}

impl From<MigrationError> for SyncError {
    fn from(err: MigrationError) -> Self {
        SyncError::Migration(err)
    }
}

impl From<ChangesetError> for SyncError {
    fn from(err: ChangesetError) -> Self {
        SyncError::Changeset(err)
    }
}

impl From<DatabaseError> for SnapshotError {
    fn from(err: DatabaseError) -> Self {
        SnapshotError::Database(err)
    }
}

impl From<DatabaseError> for StateSyncError {
    fn from(err: DatabaseError) -> Self {
        StateSyncError::Database(err)
    }
}

impl From<DatabaseError> for MigrationError {
    fn from(err: DatabaseError) -> Self {
        MigrationError::Database(err)
    }
}

impl From<SnapshotError> for MigrationError {
    fn from(err: SnapshotError) -> Self {
        MigrationError::Snapshot(err)
    }
}

impl From<DatabaseError> for ChangesetError {
    fn from(err: DatabaseError) -> Self {
        ChangesetError::Database(err)
    }
}
