//! Chain migration: moving live state from a source chain to its successor
//!
//! # Key Features
//!
//! - **Migrator** (source): declares the window, takes the genesis snapshot at
//!   the start height, records one changeset per block and halts the network
//!   at the end height
//! - **ChangesetReplicator** (destination): pulls changesets over HTTP with
//!   bounded exponential backoff and submits them as votes
//! - **ChangesetApplier** (destination): stores voted chunks idempotently and
//!   replays complete heights in order, guarded by the applied watermark
//!
//! # Heights
//!
//! ```text
//! start-1   mark migration in progress
//! start     genesis snapshot + changeset
//! ...       changeset per block
//! end       NETWORK HALTED
//! ```

pub mod applier;
pub mod backoff;
pub mod changeset;
pub mod file_store;
pub mod migrator;
pub mod payload;
pub mod replicator;
pub mod rpc_client;

pub use applier::{ChangesetApplier, ChunkDisposition};
pub use backoff::BackoffPolicy;
pub use changeset::{decode_entries, encode_entries, ChangesetEntry};
pub use file_store::{ChangesetFileStore, ChangesetMetadata};
pub use migrator::{GenesisInfo, MigrationMetadata, MigrationWindow, Migrator, MigratorConfig};
pub use payload::ChangesetChunk;
pub use replicator::{ChangesetReplicator, HeightOutcome, ReplicatorSettings};
pub use rpc_client::{ChangesetSource, HttpChangesetSource};
