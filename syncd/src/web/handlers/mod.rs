//! HTTP request handlers for the replication RPC surface.
//!
//! This module is organized by domain:
//! - `common` - Response envelope and error-to-status mapping
//! - `migration` - Migration metadata, genesis snapshot and changeset endpoints
//! - `snapshots` - Snapshot metadata and chunk endpoints for state sync

pub mod common;
pub mod migration;
pub mod snapshots;

pub use migration::*;
pub use snapshots::*;
