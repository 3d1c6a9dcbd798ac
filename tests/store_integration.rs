//! Integration tests for the storage engine public API.
//!
//! Everything here goes through `Store` (or `ChunkDb` for recovery checks) against
//! a tempdir, the way an embedding process would use the crate.

use std::io::Write;

use bytes::Bytes;
use eventfold_storage::checkpoint::Checkpoints;
use eventfold_storage::chunk::chunk_file_name;
use eventfold_storage::chunk_db::ChunkDb;
use eventfold_storage::commit::CommitDecision;
use eventfold_storage::config::MIN_CHUNK_SIZE;
use eventfold_storage::{Error, ExpectedVersion, ProposedEvent, StorageConfig, Store};
use uuid::Uuid;

/// Helper: a JSON event whose data names it.
fn proposed(event_type: &str, data: &str) -> ProposedEvent {
    ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        is_json: true,
        data: Bytes::from(data.to_string()),
        metadata: Bytes::from_static(b"{\"source\":\"test\"}"),
    }
}

fn small_chunks(dir: &std::path::Path) -> StorageConfig {
    StorageConfig::new(dir).with_chunk_size(MIN_CHUNK_SIZE)
}

#[test]
fn appended_events_read_back_in_order_with_identical_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&StorageConfig::new(dir.path())).expect("open");

    let events: Vec<ProposedEvent> = (0..5)
        .map(|i| proposed("Deposited", &format!("{{\"amount\":{i}}}")))
        .collect();
    let result = store
        .append("account-1", ExpectedVersion::NoStream, events.clone())
        .expect("append");
    assert_eq!(result.event_range, Some((0, 4)));

    let slice = store
        .read_index()
        .read_stream_forward("account-1", 0, 100)
        .expect("read");
    assert!(slice.is_end_of_stream);
    assert_eq!(slice.last_event_number, 4);
    for (i, (read, sent)) in slice.events.iter().zip(&events).enumerate() {
        assert_eq!(read.event_number, i as u64);
        assert_eq!(read.event_id, sent.event_id);
        assert_eq!(read.data, sent.data);
        assert_eq!(read.metadata, sent.metadata);
        assert!(read.is_json);
    }
}

#[test]
fn prepares_written_out_of_order_commit_in_version_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&StorageConfig::new(dir.path())).expect("open");

    let expectations = [
        ExpectedVersion::NoStream,
        ExpectedVersion::Exact(2),
        ExpectedVersion::Exact(0),
        ExpectedVersion::Exact(1),
        ExpectedVersion::Exact(3),
    ];
    let tps: Vec<u64> = expectations
        .iter()
        .map(|expected| {
            store
                .write_prepare("ES", *expected, proposed("E", "{}"))
                .expect("prepare")
        })
        .collect();

    for (tp, number) in [(tps[0], 0), (tps[2], 1), (tps[3], 2)] {
        let outcome = store.write_commit(tp).expect("commit");
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event_number, number);
    }

    let rejected = store.write_commit(tps[4]).expect("commit");
    assert_eq!(
        rejected.decision,
        CommitDecision::WrongExpectedVersion {
            stream_id: "ES".to_string(),
            expected: ExpectedVersion::Exact(3),
            current_version: Some(2),
        }
    );
    assert_eq!(rejected.commit_position, None);

    let accepted = store.write_commit(tps[1]).expect("commit");
    assert!(matches!(
        accepted.decision,
        CommitDecision::Ok {
            current_version: Some(2),
            first_event_number: 3,
            ..
        }
    ));
    assert_eq!(store.read_index().stream_version("ES"), Some(3));
}

#[test]
fn replayed_transaction_is_idempotent_and_changed_replay_is_corrupt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&StorageConfig::new(dir.path())).expect("open");

    let tp = store
        .write_prepare("orders", ExpectedVersion::NoStream, proposed("Placed", "{}"))
        .expect("prepare");
    let first = store.write_commit(tp).expect("commit");
    let replay = store.write_commit(tp).expect("replay");
    assert!(matches!(replay.decision, CommitDecision::Idempotent { .. }));
    assert_eq!(replay.commit_position, first.commit_position);
    assert_eq!(store.read_index().stream_version("orders"), Some(0));

    let batch = vec![proposed("A", "{}"), proposed("B", "{}")];
    store
        .append("batch", ExpectedVersion::NoStream, batch.clone())
        .expect("append");
    let changed = vec![batch[0].clone(), proposed("C", "{}")];
    let err = store
        .append("batch", ExpectedVersion::NoStream, changed)
        .expect_err("changed replay");
    assert!(matches!(err, Error::CorruptedIdempotency { .. }), "got {err:?}");
}

#[test]
fn all_backward_reversed_equals_all_forward() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&small_chunks(dir.path())).expect("open");

    for round in 0..15 {
        for stream in ["left", "right", "middle"] {
            store
                .append(
                    stream,
                    ExpectedVersion::Any,
                    vec![proposed("Tick", &format!("{{\"round\":{round}}}"))],
                )
                .expect("append");
        }
    }
    let index = store.read_index();

    let mut forward = Vec::new();
    let mut cursor = 0;
    loop {
        let page = index.read_all_forward(cursor, 4).expect("forward");
        forward.extend(page.events.iter().map(|e| (e.log_position, e.event_id)));
        cursor = page.next_position;
        if page.is_end_of_stream {
            break;
        }
    }

    let mut backward = Vec::new();
    let mut before = None;
    loop {
        let page = index.read_all_backward(before, 7).expect("backward");
        backward.extend(page.events.iter().map(|e| (e.log_position, e.event_id)));
        before = Some(page.next_position);
        if page.is_end_of_stream {
            break;
        }
    }
    backward.reverse();

    assert_eq!(forward.len(), 45);
    assert_eq!(forward, backward);
    assert!(forward.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn chunks_roll_over_and_reopen_with_all_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = small_chunks(dir.path());
    let mut ids = Vec::new();
    {
        let mut store = Store::open(&config).expect("open");
        for i in 0..60 {
            let event = proposed("Big", &format!("{{\"i\":{i},\"pad\":\"{}\"}}", "x".repeat(200)));
            ids.push(event.event_id);
            store
                .append("rolling", ExpectedVersion::Any, vec![event])
                .expect("append");
        }
        assert!(store.chunk_db().chunks().len() > 2, "log should span several chunks");
        store.close().expect("close");
    }

    let store = Store::open(&config).expect("reopen");
    let slice = store
        .read_index()
        .read_stream_forward("rolling", 0, 100)
        .expect("read");
    let read_ids: Vec<Uuid> = slice.events.iter().map(|e| e.event_id).collect();
    assert_eq!(read_ids, ids);
    assert_eq!(store.epoch().epoch_number, 1);
}

#[test]
fn partial_trailing_record_is_truncated_on_recovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StorageConfig::new(dir.path());
    let writer_before = {
        let mut store = Store::open(&config).expect("open");
        store
            .append("crash", ExpectedVersion::NoStream, vec![proposed("A", "{}")])
            .expect("append");
        let position = store.writer_position();
        store.close().expect("close");
        position
    };

    // A frame claiming 100 bytes of body, cut off after four.
    let tail = dir.path().join(chunk_file_name(0, 0));
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&tail)
        .expect("open tail chunk");
    file.write_all(&[100, 0, 0, 0, 1, 1, 7, 7])
        .expect("write partial record");
    drop(file);

    let db = ChunkDb::open(
        dir.path(),
        &config,
        Checkpoints::open(dir.path()).expect("checkpoints"),
    )
    .expect("recover");
    assert_eq!(db.writer_position(), writer_before);
    assert_eq!(db.checkpoints().writer_position(), writer_before);
    drop(db);

    let store = Store::open(&config).expect("reopen");
    let event = store.read_index().read_event("crash", 0).expect("event");
    assert_eq!(event.event_type, "A");
}

#[test]
fn leftover_temp_files_are_removed_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StorageConfig::new(dir.path());
    Store::open(&config).expect("open").close().expect("close");

    let leftover = dir.path().join(format!("{}.scavenge.tmp", chunk_file_name(0, 1)));
    std::fs::write(&leftover, b"half-written chunk").expect("write leftover");

    let _store = Store::open(&config).expect("reopen");
    assert!(!leftover.exists(), "temp file should be deleted on open");
}

#[test]
fn lost_writer_checkpoint_is_recovered_from_the_tail_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StorageConfig::new(dir.path());
    let writer = {
        let mut store = Store::open(&config).expect("open");
        store
            .append("s", ExpectedVersion::NoStream, vec![proposed("A", "{}")])
            .expect("append");
        let position = store.writer_position();
        store.close().expect("close");
        position
    };
    std::fs::remove_file(dir.path().join("writer.chk")).expect("remove writer checkpoint");

    let checkpoints = Checkpoints::open(dir.path()).expect("checkpoints");
    let db = ChunkDb::open(dir.path(), &config, checkpoints).expect("recover");
    assert_eq!(db.writer_position(), writer);
}

#[test]
fn soft_and_hard_delete_through_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = Store::open(&StorageConfig::new(dir.path())).expect("open");
    for stream in ["soft", "hard"] {
        store
            .append(
                stream,
                ExpectedVersion::NoStream,
                vec![proposed("A", "{}"), proposed("B", "{}")],
            )
            .expect("append");
    }

    store
        .delete_stream("soft", ExpectedVersion::Exact(1), false)
        .expect("soft delete");
    let index = store.read_index();
    let slice = index
        .read_stream_forward("soft", 0, 10)
        .expect("soft-deleted stream is still readable");
    assert!(slice.events.is_empty(), "got {:?}", slice.events);
    assert_eq!(slice.last_event_number, 1);
    let slice = index
        .read_stream_backward("soft", None, 10)
        .expect("read backward");
    assert!(slice.events.is_empty(), "got {:?}", slice.events);
    for number in [0, 1] {
        let err = index.read_event("soft", number).expect_err("hidden by $tb");
        assert!(matches!(err, Error::EventNotFound { .. }), "got {err:?}");
    }
    let in_all = |slice: eventfold_storage::AllSlice| -> Vec<u64> {
        slice
            .events
            .iter()
            .filter(|e| e.stream_id == "soft")
            .map(|e| e.event_number)
            .collect()
    };
    assert_eq!(in_all(index.read_all_forward(0, 100).expect("all")), Vec::<u64>::new());
    assert_eq!(
        in_all(index.read_all_backward(None, 100).expect("all backward")),
        Vec::<u64>::new()
    );
    assert_eq!(index.stream_version("soft"), Some(1));

    store
        .append("soft", ExpectedVersion::Exact(1), vec![proposed("C", "{}")])
        .expect("soft-deleted stream accepts writes");
    let slice = store
        .read_index()
        .read_stream_forward("soft", 0, 10)
        .expect("read");
    let numbers: Vec<u64> = slice.events.iter().map(|e| e.event_number).collect();
    assert_eq!(numbers, vec![2]);
    assert_eq!(index.read_event("soft", 2).expect("read event").event_type, "C");
    assert_eq!(in_all(index.read_all_forward(0, 100).expect("all")), vec![2]);

    store
        .delete_stream("hard", ExpectedVersion::Any, true)
        .expect("hard delete");
    let err = store
        .read_index()
        .read_stream_forward("hard", 0, 10)
        .expect_err("hard-deleted stream");
    assert!(matches!(err, Error::StreamDeleted { .. }), "got {err:?}");
    let err = store
        .append("hard", ExpectedVersion::Any, vec![proposed("D", "{}")])
        .expect_err("write after hard delete");
    assert!(matches!(err, Error::StreamDeleted { .. }), "got {err:?}");
}
