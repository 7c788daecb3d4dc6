//! Integration tests for the changeset replicator
//!
//! Tests cover:
//! - Re-chunking source changesets into vote-sized payloads
//! - Skipping heights without data and linking to the last emitted height
//! - Waiting on heights the source has not recorded yet
//! - End-of-migration marker at the window end
//! - Cursor persistence and resume
//! - Bounded retries and broadcast failures
//! - Replicated votes applied by the destination applier

mod common;

use common::fixtures::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use syncd::constants::events::CHANGESET_MIGRATION;
use syncd::errors::ChangesetError;
use syncd::migrations::changeset::{ChangeKind, Column, Relation, RowChange};
use syncd::migrations::{
    encode_entries, BackoffPolicy, ChangesetApplier, ChangesetEntry, ChangesetReplicator,
    ChangesetSource, HeightOutcome, ReplicatorSettings,
};
use syncd::voting::VoteBroadcaster;
use syncd::{BlockContext, SqlValue};
use tokio::sync::watch;

fn settings(start: u64, end: u64, budget: u64) -> ReplicatorSettings {
    ReplicatorSettings {
        start_height: start,
        end_height: end,
        chunk_budget: budget,
        max_retries: 2,
        poll_interval: Duration::from_millis(1),
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        min: Duration::from_millis(1),
        max: Duration::from_millis(2),
        factor: 2.0,
        jitter: false,
    }
}

async fn replicator(
    settings: ReplicatorSettings,
    source: Arc<MemorySource>,
    broadcaster: Arc<RecordingBroadcaster>,
    db: &TestDatabase,
) -> ChangesetReplicator {
    ChangesetReplicator::new(
        settings,
        source as Arc<dyn ChangesetSource>,
        broadcaster as Arc<dyn VoteBroadcaster>,
        db.db(),
    )
    .await
    .unwrap()
    .with_backoff(fast_backoff())
}

// ============================================================================
// Height processing
// ============================================================================

#[tokio::test]
async fn test_changeset_is_rechunked_to_budget() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let data: Vec<u8> = (0..10).collect();
    source.record_bytes(1, &data, 3);
    let replicator = replicator(settings(1, 5, 4), source, broadcaster.clone(), &db).await;

    let outcome = replicator.replicate_next().await.unwrap();

    assert_eq!(outcome, HeightOutcome::Emitted { height: 1, chunks: 3 });
    let votes = broadcaster.votes();
    assert!(votes.iter().all(|(event, _)| event == CHANGESET_MIGRATION));
    let chunks = broadcaster.chunks();
    assert_eq!(chunks.len(), 3);
    for (index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.height, 1);
        assert_eq!(chunk.chunk_idx, index as u64);
        assert_eq!(chunk.total_chunks, 3);
        assert_eq!(chunk.previous_height_with_data, None);
        assert!(chunk.payload.len() <= 4);
    }
    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.payload.clone()).collect();
    assert_eq!(joined, data);
    assert_eq!(replicator.next_height().await, 2);
    assert_eq!(replicator.last_emitted().await, Some(1));
}

#[tokio::test]
async fn test_empty_heights_are_skipped_and_linked_over() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    source.record_bytes(1, b"first", 16);
    source.record(2, Vec::new());
    source.record_bytes(3, b"third", 16);
    let replicator = replicator(settings(1, 5, 16), source, broadcaster.clone(), &db).await;

    assert_eq!(
        replicator.replicate_next().await.unwrap(),
        HeightOutcome::Emitted { height: 1, chunks: 1 }
    );
    assert_eq!(
        replicator.replicate_next().await.unwrap(),
        HeightOutcome::Skipped { height: 2 }
    );
    assert_eq!(
        replicator.replicate_next().await.unwrap(),
        HeightOutcome::Emitted { height: 3, chunks: 1 }
    );

    let chunks = broadcaster.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].height, 3);
    assert_eq!(chunks[1].previous_height_with_data, Some(1));
}

#[tokio::test]
async fn test_unrecorded_height_is_polled_again() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let replicator = replicator(settings(4, 8, 16), source.clone(), broadcaster.clone(), &db).await;

    assert_eq!(
        replicator.replicate_next().await.unwrap(),
        HeightOutcome::NotReady { height: 4 }
    );
    assert_eq!(replicator.next_height().await, 4);
    assert!(broadcaster.votes().is_empty());

    source.record_bytes(4, b"late", 16);
    assert_eq!(
        replicator.replicate_next().await.unwrap(),
        HeightOutcome::Emitted { height: 4, chunks: 1 }
    );
}

#[tokio::test]
async fn test_end_height_emits_marker_without_fetching() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    source.record_bytes(1, b"only", 16);
    let replicator = replicator(settings(1, 3, 16), source.clone(), broadcaster.clone(), &db).await;

    replicator.replicate_next().await.unwrap();
    source.record(2, Vec::new());
    replicator.replicate_next().await.unwrap();
    let calls_before_end = source.metadata_calls.load(Ordering::SeqCst);

    let outcome = replicator.replicate_next().await.unwrap();

    assert_eq!(outcome, HeightOutcome::Emitted { height: 3, chunks: 1 });
    assert_eq!(source.metadata_calls.load(Ordering::SeqCst), calls_before_end);
    let marker = broadcaster.chunks().pop().unwrap();
    assert_eq!(marker.height, 3);
    assert_eq!(marker.total_chunks, 1);
    assert!(marker.payload.is_empty());
    assert_eq!(marker.previous_height_with_data, Some(1));

    assert_eq!(replicator.replicate_next().await.unwrap(), HeightOutcome::Finished);
}

// ============================================================================
// Cursor persistence
// ============================================================================

#[tokio::test]
async fn test_cursor_resumes_after_restart() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    source.record_bytes(1, b"one", 16);
    source.record(2, Vec::new());
    source.record_bytes(3, b"three", 16);

    {
        let first = replicator(settings(1, 10, 16), source.clone(), Arc::new(RecordingBroadcaster::new()), &db).await;
        first.replicate_next().await.unwrap();
        first.replicate_next().await.unwrap();
    }

    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let resumed = replicator(settings(1, 10, 16), source, broadcaster.clone(), &db).await;

    assert_eq!(resumed.next_height().await, 3);
    assert_eq!(resumed.last_emitted().await, Some(1));
    resumed.replicate_next().await.unwrap();
    assert_eq!(broadcaster.chunks()[0].previous_height_with_data, Some(1));
}

#[tokio::test]
async fn test_persisted_cursor_below_window_starts_at_window() {
    let db = TestDatabase::new().await.unwrap();
    db.db()
        .set_replicator_values(&[("last_stored_height", 2)])
        .await
        .unwrap();

    let replicator = replicator(
        settings(7, 10, 16),
        Arc::new(MemorySource::new()),
        Arc::new(RecordingBroadcaster::new()),
        &db,
    )
    .await;

    assert_eq!(replicator.next_height().await, 7);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_transient_source_failures_are_retried() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    source.record_bytes(1, b"data", 16);
    source.fail_next(2);
    let replicator = replicator(settings(1, 5, 16), source.clone(), Arc::new(RecordingBroadcaster::new()), &db).await;

    let outcome = replicator.replicate_next().await.unwrap();

    assert_eq!(outcome, HeightOutcome::Emitted { height: 1, chunks: 1 });
    assert_eq!(source.metadata_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    source.record_bytes(1, b"data", 16);
    source.fail_next(10);
    let replicator = replicator(settings(1, 5, 16), source, Arc::new(RecordingBroadcaster::new()), &db).await;

    let result = replicator.replicate_next().await;

    assert!(matches!(
        result,
        Err(ChangesetError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(replicator.next_height().await, 1);
}

#[tokio::test]
async fn test_broadcast_failure_keeps_cursor() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    source.record_bytes(1, b"data", 16);
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    broadcaster.fail();
    let replicator = replicator(settings(1, 5, 16), source, broadcaster, &db).await;

    let result = replicator.replicate_next().await;

    assert!(matches!(result, Err(ChangesetError::Transport { .. })));
    assert_eq!(replicator.next_height().await, 1);
    assert_eq!(db.db().replicator_value("last_stored_height").await.unwrap(), None);
}

// ============================================================================
// Run loop
// ============================================================================

#[tokio::test]
async fn test_run_replicates_whole_window() {
    let db = TestDatabase::new().await.unwrap();
    let source = Arc::new(MemorySource::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    source.record_bytes(1, b"a", 16);
    source.record(2, Vec::new());
    source.record_bytes(3, b"c", 16);
    let replicator = replicator(settings(1, 4, 16), source, broadcaster.clone(), &db).await;
    let (_tx, shutdown) = watch::channel(false);

    tokio::time::timeout(Duration::from_secs(5), replicator.run(shutdown))
        .await
        .unwrap()
        .unwrap();

    let heights: Vec<u64> = broadcaster.chunks().iter().map(|c| c.height).collect();
    assert_eq!(heights, vec![1, 3, 4]);
    assert_eq!(
        db.db().replicator_value("last_emitted_height").await.unwrap(),
        Some(4)
    );
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let db = TestDatabase::new().await.unwrap();
    let replicator = replicator(
        settings(1, 4, 16),
        Arc::new(MemorySource::new()),
        Arc::new(RecordingBroadcaster::new()),
        &db,
    )
    .await;
    let (tx, shutdown) = watch::channel(false);

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
    };
    let (result, _) = tokio::join!(replicator.run(shutdown), stopper);

    assert!(result.is_ok());
    assert_eq!(replicator.next_height().await, 1);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn test_replicated_votes_apply_on_destination() {
    let source_db = TestDatabase::new().await.unwrap();
    let destination = TestDatabase::new().await.unwrap().with_app_tables().await.unwrap();
    let relation = Relation {
        schema: String::new(),
        table: "users".to_string(),
        columns: vec![
            Column {
                name: "id".to_string(),
                data_type: "int8".to_string(),
            },
            Column {
                name: "name".to_string(),
                data_type: "text".to_string(),
            },
        ],
    };
    let entries = vec![
        ChangesetEntry::Relation(relation),
        ChangesetEntry::RowChange(RowChange {
            relation: 0,
            kind: ChangeKind::Insert,
            old_tuple: None,
            new_tuple: Some(vec![SqlValue::Int(1), SqlValue::from("x".repeat(40))]),
        }),
    ];

    let source = Arc::new(MemorySource::new());
    source.record_bytes(1, &encode_entries(&entries), 10);
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let replicator = replicator(settings(1, 2, 16), source, broadcaster.clone(), &source_db).await;
    replicator.replicate_next().await.unwrap();
    replicator.replicate_next().await.unwrap();

    let applier = ChangesetApplier::new(destination.db(), Some(2));
    for (_, payload) in broadcaster.votes() {
        applier.accept_chunk(&payload).await.unwrap();
    }
    let mut block = BlockContext {
        in_migration: true,
        ..BlockContext::new(9)
    };
    let applied = applier.apply_ready(&mut block).await.unwrap();

    assert_eq!(applied, vec![1, 2]);
    assert!(!block.in_migration);
    let rows = destination.query("SELECT id, name FROM users").await.unwrap();
    assert_eq!(rows, vec![vec![SqlValue::Int(1), SqlValue::from("x".repeat(40))]]);
}
