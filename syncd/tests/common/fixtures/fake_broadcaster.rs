//! Broadcaster that records every vote instead of sending it

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use syncd::migrations::ChangesetChunk;
use syncd::voting::VoteBroadcaster;

#[derive(Default)]
pub struct RecordingBroadcaster {
    votes: Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following broadcast fail
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn votes(&self) -> Vec<(String, Vec<u8>)> {
        self.votes.lock().unwrap().clone()
    }

    /// Recorded votes decoded as changeset chunks
    pub fn chunks(&self) -> Vec<ChangesetChunk> {
        self.votes()
            .iter()
            .map(|(_, payload)| ChangesetChunk::decode(payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl VoteBroadcaster for RecordingBroadcaster {
    async fn broadcast(&self, event_type: &str, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("broadcast rejected"));
        }
        self.votes
            .lock()
            .unwrap()
            .push((event_type.to_string(), payload));
        Ok(())
    }
}
