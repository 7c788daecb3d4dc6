pub mod config;
pub mod constants;
pub mod database;
pub mod errors;
pub mod migrations;
pub mod node;
pub mod snapshot;
pub mod state_sync;
pub mod voting;
pub mod web;

// Re-export commonly used types
pub use config::{Config, ConfigManager};
pub use database::{Database, DbTx, SqlValue};
pub use errors::SyncError;
pub use migrations::{ChangesetApplier, ChangesetReplicator, Migrator};
pub use node::{BlockPipeline, NodeRoles};
pub use snapshot::{SnapshotStore, Snapshotter};
pub use state_sync::StateSyncer;
pub use voting::{BlockContext, ResolutionRegistry, VoteBroadcaster};
