//! Boundary with the node's voting and block-processing machinery
//!
//! # Key Features
//!
//! - **VoteBroadcaster**: submits a payload for network-wide confirmation
//! - **ResolutionRegistry**: built once at startup, then frozen; dispatches a
//!   confirmed payload to the handler registered for its event type
//! - **EndBlockHooks**: run in registration order at the end of every block
//! - **Local block loop**: a single-node driver that confirms every broadcast
//!   vote in the next block

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::errors::SyncError;
use crate::migrations::ChangesetEntry;

/// Per-block state shared with resolution handlers and end-block hooks
#[derive(Debug, Clone, Default)]
pub struct BlockContext {
    pub height: u64,
    /// Set while a migration window is active on this chain
    pub in_migration: bool,
    /// Row-level writes of this block, filled in by the host's block execution
    pub changeset: Vec<ChangesetEntry>,
}

impl BlockContext {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            in_migration: false,
            changeset: Vec::new(),
        }
    }
}

#[async_trait]
pub trait VoteBroadcaster: Send + Sync {
    async fn broadcast(&self, event_type: &str, payload: Vec<u8>) -> Result<()>;
}

/// Invoked exactly once for every confirmed vote of its event type
#[async_trait]
pub trait ResolutionHandler: Send + Sync {
    async fn resolve(&self, payload: &[u8], block: &mut BlockContext) -> Result<(), SyncError>;
}

#[async_trait]
pub trait EndBlockHook: Send + Sync {
    fn name(&self) -> &str;

    async fn end_block(&self, block: &mut BlockContext) -> Result<(), SyncError>;
}

#[derive(Default)]
pub struct ResolutionRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ResolutionHandler>>,
}

impl ResolutionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        event_type: &str,
        handler: Arc<dyn ResolutionHandler>,
    ) -> Result<Self, SyncError> {
        if self.handlers.contains_key(event_type) {
            return Err(SyncError::Other(format!(
                "resolution handler for '{}' already registered",
                event_type
            )));
        }
        self.handlers.insert(event_type.to_string(), handler);
        Ok(self)
    }

    pub fn build(self) -> ResolutionRegistry {
        ResolutionRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable map from event type to handler
pub struct ResolutionRegistry {
    handlers: HashMap<String, Arc<dyn ResolutionHandler>>,
}

impl ResolutionRegistry {
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub async fn resolve(
        &self,
        event_type: &str,
        payload: &[u8],
        block: &mut BlockContext,
    ) -> Result<(), SyncError> {
        let handler = self.handlers.get(event_type).ok_or_else(|| {
            SyncError::Other(format!("no resolution handler for '{}'", event_type))
        })?;
        handler.resolve(payload, block).await
    }
}

#[derive(Default)]
pub struct EndBlockHooks {
    hooks: Vec<Arc<dyn EndBlockHook>>,
}

impl EndBlockHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn EndBlockHook>) {
        self.hooks.push(hook);
    }

    /// Runs every hook in order; the first failure stops the block
    pub async fn run(&self, block: &mut BlockContext) -> Result<(), SyncError> {
        for hook in &self.hooks {
            debug!("Running end-block hook {} at height {}", hook.name(), block.height);
            hook.end_block(block).await?;
        }
        Ok(())
    }
}

/// A vote waiting for confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub event_type: String,
    pub payload: Vec<u8>,
}

/// Broadcaster feeding the local block loop
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: mpsc::UnboundedSender<Vote>,
}

impl ChannelBroadcaster {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl VoteBroadcaster for ChannelBroadcaster {
    async fn broadcast(&self, event_type: &str, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(Vote {
                event_type: event_type.to_string(),
                payload,
            })
            .map_err(|_| anyhow!("block loop is no longer accepting votes"))
    }
}

/// Produces one block per interval: resolves every vote queued since the
/// previous block, then runs the end-block hooks. A failing hook halts the
/// loop, as it would halt a node.
pub async fn run_local_blocks(
    registry: Arc<ResolutionRegistry>,
    hooks: Arc<EndBlockHooks>,
    mut votes: mpsc::UnboundedReceiver<Vote>,
    mut block: BlockContext,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<BlockContext> {
    info!("Starting local block loop at height {}", block.height + 1);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("Local block loop stopped at height {}", block.height);
                return Ok(block);
            }
        }

        block.height += 1;
        block.changeset.clear();
        while let Ok(vote) = votes.try_recv() {
            if let Err(e) = registry.resolve(&vote.event_type, &vote.payload, &mut block).await {
                // A rejected vote does not stop the chain
                error!(
                    "Resolution of '{}' at height {} failed: {}",
                    vote.event_type, block.height, e
                );
            }
        }

        if let Err(e) = hooks.run(&mut block).await {
            error!("End-block hooks failed at height {}: {}", block.height, e);
            return Err(anyhow!("halted at height {}: {}", block.height, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<(u64, Vec<u8>)>>);

    #[async_trait]
    impl ResolutionHandler for Recorder {
        async fn resolve(&self, payload: &[u8], block: &mut BlockContext) -> Result<(), SyncError> {
            self.0.lock().unwrap().push((block.height, payload.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_event_type() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let registry = ResolutionRegistryBuilder::new()
            .register("a", recorder.clone())
            .unwrap()
            .build();

        let mut block = BlockContext::new(4);
        registry.resolve("a", b"x", &mut block).await.unwrap();
        assert!(registry.resolve("b", b"y", &mut block).await.is_err());
        assert_eq!(*recorder.0.lock().unwrap(), vec![(4, b"x".to_vec())]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let result = ResolutionRegistryBuilder::new()
            .register("a", recorder.clone())
            .unwrap()
            .register("a", recorder);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn channel_votes_resolve_in_next_block() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let registry = Arc::new(
            ResolutionRegistryBuilder::new()
                .register("a", recorder.clone())
                .unwrap()
                .build(),
        );
        let (broadcaster, rx) = ChannelBroadcaster::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        broadcaster.broadcast("a", vec![1]).await.unwrap();
        let handle = tokio::spawn(run_local_blocks(
            registry,
            Arc::new(EndBlockHooks::new()),
            rx,
            BlockContext::new(10),
            Duration::from_millis(5),
            stop_rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let block = handle.await.unwrap().unwrap();

        assert!(block.height > 10);
        assert_eq!(*recorder.0.lock().unwrap(), vec![(11, vec![1])]);
    }
}
