// File: syncd/src/web/mod.rs
pub mod handlers;
pub mod server;

pub use handlers::common::ApiResponse;
pub use server::{create_router, start_web_server};

use std::sync::Arc;

use crate::migrations::Migrator;
use crate::snapshot::SnapshotStore;

// Application state shared across all handlers
#[derive(Clone, Default)]
pub struct AppState {
    // Recurring snapshots served to joining nodes
    pub snapshots: Option<Arc<SnapshotStore>>,
    // Source-side migration surface
    pub migrator: Option<Arc<Migrator>>,
}

impl AppState {
    pub fn new(snapshots: Option<Arc<SnapshotStore>>, migrator: Option<Arc<Migrator>>) -> Self {
        Self {
            snapshots,
            migrator,
        }
    }
}
