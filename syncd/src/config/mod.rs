pub mod manager;
use serde::{Deserialize, Serialize};
pub use manager::ConfigManager;

use crate::constants::{changeset, replicator, snapshot};
use crate::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub statesync: StateSyncConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub replicator: ReplicatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8484
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    // Full connection URL; when set it wins over the individual fields.
    // A `sqlite:` URL selects the embedded backend.
    pub url: Option<String>,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub dbname: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    // Native dump/restore binaries
    #[serde(default = "default_pg_dump")]
    pub pg_dump_path: String,
    #[serde(default = "default_psql")]
    pub psql_path: String,
    // Any row in this table means the database holds state
    #[serde(default = "default_canonical_table")]
    pub canonical_table: String,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "kwild".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_dump() -> String {
    "pg_dump".to_string()
}

fn default_psql() -> String {
    "psql".to_string()
}

fn default_canonical_table() -> String {
    "kwild_voting.voters".to_string()
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.dbname
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_snapshot_dir")]
    pub dir: String,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    #[serde(default = "default_recurring_height")]
    pub recurring_height: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_row_size")]
    pub max_row_size: usize,
    #[serde(default = "default_schemas")]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    #[serde(default)]
    pub exclude_table_data: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_snapshot_dir(),
            max_snapshots: default_max_snapshots(),
            recurring_height: default_recurring_height(),
            chunk_size: default_chunk_size(),
            max_row_size: default_max_row_size(),
            schemas: default_schemas(),
            exclude_tables: Vec::new(),
            exclude_table_data: Vec::new(),
        }
    }
}

fn default_snapshot_dir() -> String {
    "data/snapshots".to_string()
}

fn default_max_snapshots() -> usize {
    snapshot::DEFAULT_MAX_SNAPSHOTS
}

fn default_recurring_height() -> u64 {
    snapshot::DEFAULT_RECURRING_HEIGHT
}

fn default_chunk_size() -> u64 {
    snapshot::CHUNK_SIZE
}

fn default_max_row_size() -> usize {
    snapshot::DEFAULT_MAX_ROW_SIZE
}

fn default_schemas() -> Vec<String> {
    vec![
        "kwild_voting".to_string(),
        "kwild_accts".to_string(),
        "kwild_internal".to_string(),
        "ds_*".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_statesync_dir")]
    pub dir: String,
    #[serde(default)]
    pub trusted_providers: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_statesync_dir(),
            trusted_providers: Vec::new(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_statesync_dir() -> String {
    "data/rcvdSnaps".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    // Source role: serve a declared window's genesis snapshot and changesets
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_migration_dir")]
    pub dir: String,
    // Size of the chunks a source node serves its stored changesets in
    #[serde(default = "default_source_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_migration_exclude_tables")]
    pub exclude_tables: Vec<String>,
    #[serde(default = "default_migration_exclude_data")]
    pub exclude_table_data: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_migration_dir(),
            chunk_size: default_source_chunk_size(),
            exclude_tables: default_migration_exclude_tables(),
            exclude_table_data: default_migration_exclude_data(),
        }
    }
}

fn default_migration_dir() -> String {
    "data/migrations".to_string()
}

fn default_source_chunk_size() -> u64 {
    changeset::SOURCE_CHUNK_SIZE
}

fn default_migration_exclude_tables() -> Vec<String> {
    vec!["kwild_internal.sentry".to_string()]
}

fn default_migration_exclude_data() -> Vec<String> {
    vec!["kwild_voting.voters".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub enabled: bool,
    // Base URL of the source chain's migration RPC surface
    pub source_url: Option<String>,
    #[serde(default)]
    pub start_height: u64,
    #[serde(default)]
    pub end_height: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_block_bytes")]
    pub max_block_bytes: u64,
    // Overrides the one-third-of-a-block chunk budget
    pub changeset_chunk_size: Option<u64>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_url: None,
            start_height: 0,
            end_height: 0,
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            max_block_bytes: default_max_block_bytes(),
            changeset_chunk_size: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    replicator::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_max_retries() -> u32 {
    replicator::DEFAULT_MAX_RETRIES
}

fn default_max_block_bytes() -> u64 {
    replicator::DEFAULT_MAX_BLOCK_BYTES
}

impl ReplicatorConfig {
    /// Chunk budget for changeset votes on the destination chain
    pub fn chunk_budget(&self) -> u64 {
        self.changeset_chunk_size
            .unwrap_or(self.max_block_bytes / 3)
            .max(1)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshots.enabled {
            if self.snapshots.recurring_height == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "snapshots.recurring_height".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            if self.snapshots.max_snapshots == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "snapshots.max_snapshots".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.snapshots.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "snapshots.chunk_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.statesync.enabled && self.statesync.trusted_providers.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "statesync.trusted_providers".to_string(),
            });
        }

        if self.migration.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "migration.chunk_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.replicator.enabled {
            if self.migration.enabled {
                return Err(ConfigError::InvalidValue {
                    field: "migration.enabled".to_string(),
                    reason: "a node cannot serve and replay a migration at once".to_string(),
                });
            }
            if self.replicator.source_url.is_none() {
                return Err(ConfigError::MissingRequired {
                    field: "replicator.source_url".to_string(),
                });
            }
            if self.replicator.start_height >= self.replicator.end_height {
                return Err(ConfigError::InvalidValue {
                    field: "replicator.end_height".to_string(),
                    reason: format!(
                        "end height {} must be above start height {}",
                        self.replicator.end_height, self.replicator.start_height
                    ),
                });
            }
        }

        Ok(())
    }
}
