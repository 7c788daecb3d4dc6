//! This module provides reusable test utilities:
//! - In-memory test databases
//! - A scripted dump tool that records what gets restored
//! - Real on-disk snapshots built from a scripted dump
//! - In-memory snapshot providers and changeset sources
//! - Mock HTTP servers for the source chain and trusted providers
//! - A broadcaster that records votes

// Allow unused code in test fixtures - each test binary uses a subset
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fake_broadcaster;
pub mod fake_dump;
pub mod memory_peers;
pub mod mock_source;
pub mod snapshots;
pub mod test_database;

// Re-export commonly used items
pub use fake_broadcaster::RecordingBroadcaster;
pub use fake_dump::FakeDumpTool;
pub use memory_peers::{MemorySource, StaticProvider};
pub use mock_source::MockSourceServer;
pub use snapshots::{build_snapshot, open_store, read_chunks, store_config, TEST_CHUNK_SIZE};
pub use test_database::TestDatabase;
