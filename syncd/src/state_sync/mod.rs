//! Snapshot bootstrap for joining nodes
//!
//! A node with an empty database accepts a snapshot offer only after a trusted
//! provider confirms the same height, size, chunk count and hash. Chunks are
//! verified one by one and the restored stream is verified as a whole.
//!
//! State machine: `Idle → Collecting → (restore) → Idle`. Any failure during
//! restore returns to `Idle` with an empty chunk directory.

pub mod rpc_client;
pub mod syncer;

pub use rpc_client::{fetch_latest_snapshot, http_providers, HttpSnapshotProvider, SnapshotProvider};
pub use syncer::{ChunkOutcome, StateSyncer};
