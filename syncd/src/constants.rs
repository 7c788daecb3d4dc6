//! Central repository for protocol constants and default limits
//!
//! Values that peers must agree on (chunk sizes, stage file names, wire tags)
//! live next to the tunable defaults so the two are easy to tell apart.

use std::time::Duration;

/// Snapshot layout and chunking
pub mod snapshot {
    /// Only snapshot format produced and accepted by this node
    pub const DEFAULT_FORMAT: u32 = 0;

    /// 16 MB minus 4 KiB, so a chunk plus framing stays under 16 MB message ceilings
    pub const CHUNK_SIZE: u64 = 16_000_000 - 4096;

    pub const STAGE1_DUMP_FILE: &str = "stage1output.sql";
    pub const STAGE2_SANITIZED_FILE: &str = "stage2output.sql";
    pub const STAGE3_COMPRESSED_FILE: &str = "stage3output.sql.gz";

    pub const HEADER_FILE: &str = "header.json";
    pub const CHUNKS_DIR: &str = "chunks";

    /// Longest dump line the sanitizer will buffer
    pub const DEFAULT_MAX_ROW_SIZE: usize = 4 * 1024 * 1024;

    pub const DEFAULT_MAX_SNAPSHOTS: usize = 3;
    pub const DEFAULT_RECURRING_HEIGHT: u64 = 14_400;
}

/// Source-side changeset storage
pub mod changeset {
    /// Chunk size used when a source node serves its stored changesets
    pub const SOURCE_CHUNK_SIZE: u64 = 4_000_000;

    /// Length of the `[type u8][len u32 LE]` record prefix
    pub const ENTRY_PREFIX_LEN: usize = 5;

    pub const METADATA_FILE: &str = "metadata.json";

    /// Version tag of the changeset vote payload
    pub const CHUNK_PAYLOAD_VERSION: u16 = 0;
}

/// Replicator defaults
pub mod replicator {
    use super::Duration;

    pub const DEFAULT_MAX_RETRIES: u32 = 10;

    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub const BACKOFF_MIN: Duration = Duration::from_secs(1);
    pub const BACKOFF_MAX: Duration = Duration::from_secs(10);
    pub const BACKOFF_FACTOR: f64 = 2.0;

    /// Destination block budget assumed when none is configured
    pub const DEFAULT_MAX_BLOCK_BYTES: u64 = 6 * 1024 * 1024;
}

/// Local block loop
pub mod blocks {
    use super::Duration;

    /// Time between blocks produced by a single-node chain
    pub const LOCAL_BLOCK_INTERVAL: Duration = Duration::from_secs(1);
}

/// Voting event types
pub mod events {
    pub const CHANGESET_MIGRATION: &str = "changeset_migration";
    pub const MIGRATION_DECLARATION: &str = "migration_declaration";
}

/// HTTP client constants
pub mod http {
    use super::Duration;

    /// Default timeout for requests to trusted providers and source chains
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Timeout for establishing HTTP connections
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}
