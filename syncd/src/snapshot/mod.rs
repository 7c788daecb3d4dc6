//! Deterministic database snapshots and their local retention
//!
//! Snapshots are logical dumps that every node holding the same database
//! content turns into byte-identical chunks, so a joining node can verify each
//! chunk against hashes agreed by trusted providers.
//!
//! # Key Features
//!
//! - **Deterministic Dumps**: Sanitized `pg_dump` output with COPY rows ordered by row hash
//! - **Hash-Addressed Chunks**: Gzip stream split into ~16 MB chunks, each with its own sha256
//! - **Retention Management**: Lowest heights evicted first beyond `max_snapshots`
//! - **Crash Safety**: A failed or cancelled creation leaves no directory behind
//!
//! # Snapshot Process
//!
//! 1. Dump the requested schemas through the caller's consistent view (`stage1output.sql`)
//! 2. Sanitize and hash the dump (`stage2output.sql`)
//! 3. Gzip the sanitized dump (`stage3output.sql.gz`)
//! 4. Split into `chunks/chunk-<i>.sql.gz` and write `header.json`

pub mod dump;
pub mod sanitize;
pub mod snapshotter;
pub mod store;
pub mod types;

pub use dump::{DumpRequest, DumpTool, PgDumpTool, RestoreSink};
pub use snapshotter::Snapshotter;
pub use store::{RecurringSnapshots, SnapshotStore, SnapshotStoreConfig};
pub use types::{Hash, Snapshot};
