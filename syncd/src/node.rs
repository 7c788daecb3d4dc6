//! Block-driven roles of a running node
//!
//! Each role contributes resolution handlers and end-block hooks:
//!
//! - **Migration source**: the migrator resolves window declarations and
//!   records every block's changeset
//! - **Recurring snapshots**: due snapshots start in the background
//! - **Migration destination**: the changeset applier stores voted chunks and
//!   replays complete heights
//!
//! A node is never source and destination of a migration at once.

use std::sync::Arc;
use tracing::info;

use crate::constants::events::{CHANGESET_MIGRATION, MIGRATION_DECLARATION};
use crate::database::Database;
use crate::errors::SyncError;
use crate::migrations::{ChangesetApplier, Migrator};
use crate::snapshot::{RecurringSnapshots, SnapshotStore};
use crate::voting::{BlockContext, EndBlockHooks, ResolutionRegistry, ResolutionRegistryBuilder};

#[derive(Default, Clone)]
pub struct NodeRoles {
    pub migrator: Option<Arc<Migrator>>,
    pub snapshots: Option<Arc<SnapshotStore>>,
    pub applier: Option<Arc<ChangesetApplier>>,
}

/// Everything the local block loop needs to produce blocks
pub struct BlockPipeline {
    pub registry: Arc<ResolutionRegistry>,
    pub hooks: Arc<EndBlockHooks>,
    /// Last block already processed; the loop continues from the next height
    pub block: BlockContext,
}

impl NodeRoles {
    pub fn is_empty(&self) -> bool {
        self.migrator.is_none() && self.snapshots.is_none() && self.applier.is_none()
    }

    /// Builds the frozen registry and the hook list. The migrator runs first
    /// so it sees the block before any snapshot of it is taken.
    pub async fn assemble(&self, db: &Database) -> Result<BlockPipeline, SyncError> {
        if self.migrator.is_some() && self.applier.is_some() {
            return Err(SyncError::Other(
                "a node cannot be migration source and destination at once".to_string(),
            ));
        }

        let mut registry = ResolutionRegistryBuilder::new();
        let mut hooks = EndBlockHooks::new();
        let mut block = BlockContext::new(0);

        if let Some(migrator) = &self.migrator {
            registry = registry.register(MIGRATION_DECLARATION, migrator.clone())?;
            hooks.register(migrator.clone());
            if let Some(height) = migrator.last_changeset_height().await {
                block.height = block.height.max(height);
            }
            if let Some(window) = migrator.active_window().await {
                block.in_migration = block.height + 1 >= window.start_height;
            }
        }

        if let Some(store) = &self.snapshots {
            hooks.register(Arc::new(RecurringSnapshots::new(store.clone(), db.clone())));
            if let Some(latest) = store.latest_snapshot().await {
                block.height = block.height.max(latest.height);
            }
        }

        if let Some(applier) = &self.applier {
            registry = registry.register(CHANGESET_MIGRATION, applier.clone())?;
            hooks.register(applier.clone());
            block.in_migration = true;
        }

        let registry = registry.build();
        info!(
            "Block pipeline resumes after height {} with handlers {:?}",
            block.height,
            registry.event_types()
        );
        Ok(BlockPipeline {
            registry: Arc::new(registry),
            hooks: Arc::new(hooks),
            block,
        })
    }
}
