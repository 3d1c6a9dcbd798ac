//! Integration tests for scavenging through the public API.
//!
//! Each test builds a log with small chunks, forces the interesting data out of the
//! tail chunk, scavenges, and checks that reads are unchanged while the dropped
//! records are physically gone, also after a reopen.

use bytes::Bytes;
use eventfold_storage::codec::LogRecord;
use eventfold_storage::config::MIN_CHUNK_SIZE;
use eventfold_storage::types::metastream_of;
use eventfold_storage::{
    Error, ExpectedVersion, ProposedEvent, RecordedEvent, ScavengeOptions, Scavenger,
    StorageConfig, Store, StreamMetadata,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn config(dir: &std::path::Path) -> StorageConfig {
    StorageConfig::new(dir).with_chunk_size(MIN_CHUNK_SIZE)
}

fn proposed(payload: &str) -> ProposedEvent {
    ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type: "Sample".to_string(),
        is_json: false,
        data: Bytes::from(payload.to_string()),
        metadata: Bytes::new(),
    }
}

fn roll_past_current_chunk(store: &mut Store) {
    let start = store.chunk_db().chunks().len();
    while store.chunk_db().chunks().len() == start {
        store
            .append("filler", ExpectedVersion::Any, vec![proposed(&"f".repeat(300))])
            .expect("filler");
    }
}

fn scavenge(store: &Store) -> eventfold_storage::ScavengeResult {
    Scavenger::new(
        store.chunk_db(),
        store.read_index(),
        ScavengeOptions::default(),
    )
    .scavenge(&CancellationToken::new())
    .expect("scavenge")
}

fn read_stream(store: &Store, stream: &str) -> Vec<RecordedEvent> {
    store
        .read_index()
        .read_stream_forward(stream, 0, 1000)
        .expect("read")
        .events
}

/// Prepares physically present in the log for `stream`.
fn prepares_on_disk(store: &Store, stream: &str) -> usize {
    let db = store.chunk_db();
    db.scan_forward(0, db.writer_position())
        .map(|item| item.expect("scan").0)
        .filter(|record| matches!(record, LogRecord::Prepare(p) if p.stream_id == stream))
        .count()
}

#[test]
fn max_count_stream_keeps_last_events_at_original_positions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&config(dir.path())).expect("open");
    let metadata = StreamMetadata {
        max_count: Some(4),
        ..StreamMetadata::default()
    };
    store
        .set_stream_metadata("sensor", ExpectedVersion::Any, &metadata)
        .expect("metadata");
    for i in 0..25 {
        store
            .append(
                "sensor",
                ExpectedVersion::Any,
                vec![proposed(&format!("reading-{i}"))],
            )
            .expect("append");
    }
    roll_past_current_chunk(&mut store);

    let before = read_stream(&store, "sensor");
    assert_eq!(before.len(), 4);
    assert_eq!(prepares_on_disk(&store, "sensor"), 25);

    let result = scavenge(&store);
    assert!(result.chunks_scavenged >= 1);
    assert!(result.records_dropped >= 21);
    assert!(result.bytes_reclaimed > 0);

    let after = read_stream(&store, "sensor");
    assert_eq!(after, before, "identical events at identical positions");
    assert_eq!(prepares_on_disk(&store, "sensor"), 4);

    store.close().expect("close");
    let store = Store::open(&config(dir.path())).expect("reopen");
    assert_eq!(read_stream(&store, "sensor"), before);
    assert_eq!(prepares_on_disk(&store, "sensor"), 4);
}

#[test]
fn metastream_keeps_only_latest_metaevent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&config(dir.path())).expect("open");
    store
        .append("configured", ExpectedVersion::NoStream, vec![proposed("a")])
        .expect("append");
    for age in 1..=6u64 {
        let metadata = StreamMetadata {
            max_age_secs: Some(age * 3600),
            ..StreamMetadata::default()
        };
        store
            .set_stream_metadata("configured", ExpectedVersion::Any, &metadata)
            .expect("metadata");
    }
    roll_past_current_chunk(&mut store);
    let meta = metastream_of("configured");
    assert_eq!(prepares_on_disk(&store, &meta), 6);

    scavenge(&store);

    assert_eq!(prepares_on_disk(&store, &meta), 1);
    let current = store
        .read_index()
        .get_stream_metadata("configured")
        .expect("metadata");
    assert_eq!(current.metastream_version, Some(5));
    assert_eq!(current.metadata.max_age_secs, Some(6 * 3600));
    assert_eq!(read_stream(&store, "configured").len(), 1);
}

#[test]
fn hard_deleted_stream_is_reduced_to_its_tombstone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&config(dir.path())).expect("open");
    for i in 0..10 {
        store
            .append("doomed", ExpectedVersion::Any, vec![proposed(&format!("d{i}"))])
            .expect("append");
    }
    store
        .append("survivor", ExpectedVersion::NoStream, vec![proposed("s")])
        .expect("append");
    store
        .delete_stream("doomed", ExpectedVersion::Exact(9), true)
        .expect("hard delete");
    roll_past_current_chunk(&mut store);

    let survivor_before = read_stream(&store, "survivor");
    scavenge(&store);

    assert_eq!(prepares_on_disk(&store, "doomed"), 1, "only the tombstone stays");
    assert!(store.read_index().is_deleted("doomed"));
    assert_eq!(read_stream(&store, "survivor"), survivor_before);

    store.close().expect("close");
    let store = Store::open(&config(dir.path())).expect("reopen");
    assert!(store.read_index().is_deleted("doomed"));
    assert_eq!(read_stream(&store, "survivor"), survivor_before);
}

#[test]
fn merged_chunks_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&config(dir.path()).with_merge_chunks(true)).expect("open");
    let metadata = StreamMetadata {
        max_count: Some(1),
        ..StreamMetadata::default()
    };
    store
        .set_stream_metadata("filler", ExpectedVersion::Any, &metadata)
        .expect("metadata");
    store
        .append("kept", ExpectedVersion::NoStream, vec![proposed("k")])
        .expect("append");
    for _ in 0..3 {
        roll_past_current_chunk(&mut store);
    }
    let chunks_before = store.chunk_db().chunks().len();

    let result = Scavenger::new(
        store.chunk_db(),
        store.read_index(),
        ScavengeOptions { merge_chunks: true },
    )
    .scavenge(&CancellationToken::new())
    .expect("scavenge");
    assert!(result.chunks_scavenged >= 2);
    assert!(store.chunk_db().chunks().len() < chunks_before);

    let kept = read_stream(&store, "kept");
    store.close().expect("close");

    let store = Store::open(&config(dir.path()).with_merge_chunks(true)).expect("reopen");
    assert_eq!(read_stream(&store, "kept"), kept);
    assert_eq!(read_stream(&store, "filler").len(), 1);
}

#[test]
fn rejected_and_stale_prepares_do_not_accumulate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stale = {
        let mut store = Store::open(&config(dir.path())).expect("open");
        let stale = store
            .write_prepare("contended", ExpectedVersion::NoStream, proposed("stale"))
            .expect("prepare");
        store.close().expect("close");
        stale
    };

    let mut store = Store::open(&config(dir.path())).expect("reopen");
    for i in 0..200 {
        let err = store
            .append(
                "contended",
                ExpectedVersion::Exact(99),
                vec![proposed(&format!("retry-{i}"))],
            )
            .expect_err("stream has no version 99");
        assert!(matches!(err, Error::WrongExpectedVersion { .. }), "got {err:?}");
    }
    assert_eq!(store.read_index().pending_transactions(), 0);
    let err = store.write_commit(stale).expect_err("earlier epoch");
    assert!(matches!(err, Error::InvalidTransaction { .. }), "got {err:?}");
    roll_past_current_chunk(&mut store);
    assert_eq!(prepares_on_disk(&store, "contended"), 201);

    let result = scavenge(&store);
    assert!(result.chunks_scavenged >= 1);
    assert!(result.records_dropped >= 201);
    assert_eq!(prepares_on_disk(&store, "contended"), 0);

    store.close().expect("close");
    let store = Store::open(&config(dir.path())).expect("reopen");
    assert_eq!(store.read_index().pending_transactions(), 0);
    assert_eq!(prepares_on_disk(&store, "contended"), 0);
}
