//! Background scavenging of completed chunks.
//!
//! A pass walks the completed chunks (never the tail) and rewrites those holding
//! records that can no longer be read: events hidden by `$tb`, `$maxCount` or
//! `$maxAge`, superseded metaevents, everything but the tombstone of a
//! hard-deleted stream, and prepares of transactions that can never commit. Kept
//! records stay at their original log positions; the
//! rewritten chunk addresses them through a position map. The rewritten chunk is
//! swapped in with [`ChunkDb::replace_chunks`], so readers holding the old chunk
//! finish undisturbed.
//!
//! Keep decisions use the same liveness predicate as reads, so a scavenge never
//! changes what a read returns. The last event of every stream is kept even when
//! `$tb` hides it, so the stream version survives an index rebuild.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chunk::{Chunk, ChunkHeader};
use crate::chunk_db::ChunkDb;
use crate::codec::{LogRecord, encode_record};
use crate::error::Error;
use crate::index::{IndexState, ReadIndex};
use crate::types::now_millis;

/// Scavenger options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScavengeOptions {
    /// Merge consecutive scavenged chunks while their data fits in one chunk.
    pub merge_chunks: bool,
}

/// Summary of one scavenge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScavengeResult {
    /// Original chunks replaced by rewritten ones.
    pub chunks_scavenged: usize,
    /// Chunks left alone because nothing could be dropped.
    pub chunks_skipped: usize,
    /// Chunks whose rewrite failed; they are unchanged.
    pub chunks_failed: usize,
    /// Records removed from the log.
    pub records_dropped: usize,
    /// Physical bytes of record data removed.
    pub bytes_reclaimed: u64,
    /// Chunk number to resume from when the pass was cancelled.
    pub next_chunk: Option<u32>,
    pub elapsed: Duration,
}

/// Which records of one chunk survive.
struct ChunkPlan {
    chunk: Arc<Chunk>,
    /// Positions of kept records, ascending.
    keep: Vec<u64>,
    dropped: usize,
    /// Physical bytes the kept records need.
    kept_bytes: u64,
}

/// Rewrites completed chunks without the records nobody can read anymore.
#[derive(Debug)]
pub struct Scavenger {
    db: Arc<ChunkDb>,
    index: ReadIndex,
    options: ScavengeOptions,
}

impl Scavenger {
    /// Create a scavenger over `db`, judging liveness with `index`.
    pub fn new(db: Arc<ChunkDb>, index: ReadIndex, options: ScavengeOptions) -> Scavenger {
        Scavenger { db, index, options }
    }

    /// Run one pass over all completed chunks.
    ///
    /// Failures are isolated per chunk: a chunk that cannot be rewritten is logged
    /// and counted in [`ScavengeResult::chunks_failed`], the originals stay in place,
    /// and the pass continues.
    ///
    /// # Arguments
    ///
    /// * `token` - Checked between chunks.
    ///
    /// # Returns
    ///
    /// A [`ScavengeResult`] describing the pass.
    ///
    /// # Errors
    ///
    /// Per-chunk errors are not returned; the signature leaves room for failures
    /// that affect the whole pass.
    pub fn scavenge(&self, token: &CancellationToken) -> Result<ScavengeResult, Error> {
        let started = Instant::now();
        let chunks = self.db.completed_chunks();
        let now = now_millis();
        let mut result = ScavengeResult::default();
        tracing::info!(chunks = chunks.len(), "scavenge started");

        let mut i = 0;
        while i < chunks.len() {
            if token.is_cancelled() {
                result.next_chunk = Some(chunks[i].header().start_number);
                tracing::info!(next_chunk = chunks[i].header().start_number, "scavenge cancelled");
                break;
            }

            let plan = match self.plan_chunk(&chunks[i], now) {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::warn!(
                        chunk = chunks[i].header().start_number,
                        error = %e,
                        "failed to read chunk for scavenge"
                    );
                    result.chunks_failed += 1;
                    i += 1;
                    continue;
                }
            };

            let mut group = vec![plan];
            if self.options.merge_chunks {
                let mut total = group[0].kept_bytes;
                while let Some(next) = chunks.get(i + group.len()) {
                    match self.plan_chunk(next, now) {
                        Ok(plan) if total + plan.kept_bytes <= self.db.chunk_size() => {
                            total += plan.kept_bytes;
                            group.push(plan);
                        }
                        _ => break,
                    }
                }
            }
            i += group.len();

            if group.len() == 1 && group[0].dropped == 0 {
                result.chunks_skipped += 1;
                continue;
            }

            let dropped: usize = group.iter().map(|p| p.dropped).sum();
            match self.rewrite(&group) {
                Ok(reclaimed) => {
                    result.chunks_scavenged += group.len();
                    result.records_dropped += dropped;
                    result.bytes_reclaimed += reclaimed;
                    counter!("eventfold_chunks_scavenged_total").increment(group.len() as u64);
                    counter!("eventfold_scavenge_bytes_reclaimed_total").increment(reclaimed);
                }
                Err(e) => {
                    tracing::warn!(
                        start = group[0].chunk.header().start_number,
                        chunks = group.len(),
                        error = %e,
                        "chunk scavenge failed, originals kept"
                    );
                    result.chunks_failed += group.len();
                }
            }
        }

        result.elapsed = started.elapsed();
        tracing::info!(
            scavenged = result.chunks_scavenged,
            skipped = result.chunks_skipped,
            failed = result.chunks_failed,
            records_dropped = result.records_dropped,
            bytes_reclaimed = result.bytes_reclaimed,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "scavenge finished"
        );
        Ok(result)
    }

    /// Dry run: decide which records of `chunk` survive.
    fn plan_chunk(&self, chunk: &Arc<Chunk>, now: u64) -> Result<ChunkPlan, Error> {
        let mut plan = ChunkPlan {
            chunk: Arc::clone(chunk),
            keep: Vec::new(),
            dropped: 0,
            kept_bytes: 0,
        };
        for item in chunk.scan_forward(chunk.header().start_position()) {
            let (record, _) = item?;
            let keep = {
                let state = self.index.state.read().expect("IndexState RwLock poisoned");
                should_keep(&state, &record, now)
            };
            if keep {
                plan.keep.push(record.log_position());
                plan.kept_bytes += encode_record(&record).len() as u64;
            } else {
                plan.dropped += 1;
            }
        }
        Ok(plan)
    }

    /// Write the kept records of `group` into one new chunk and swap it in.
    /// Returns the physical bytes reclaimed.
    fn rewrite(&self, group: &[ChunkPlan]) -> Result<u64, Error> {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            return Ok(0);
        };
        let first_header = first.chunk.header();
        let header = ChunkHeader {
            chunk_size: first_header.chunk_size,
            start_number: first_header.start_number,
            end_number: last.chunk.header().end_number,
            generation: group
                .iter()
                .map(|p| p.chunk.header().generation)
                .max()
                .unwrap_or(0)
                + 1,
        };
        let logical_size = last.chunk.data_end_position() - first_header.start_position();
        let target = Chunk::create_scavenge_target(self.db.dir(), header, logical_size)?;

        let written = (|| -> Result<(), Error> {
            for plan in group {
                copy_kept(plan, &target)?;
            }
            target.complete()?;
            self.db.replace_chunks(Arc::clone(&target))?;
            Ok(())
        })();
        if let Err(e) = written {
            target.mark_for_deletion();
            return Err(e);
        }

        let before: u64 = group.iter().map(|p| p.chunk.physical_data_size()).sum();
        Ok(before.saturating_sub(target.physical_data_size()))
    }
}

/// Copy the records listed in `plan.keep` into `target` at their positions.
fn copy_kept(plan: &ChunkPlan, target: &Chunk) -> Result<(), Error> {
    let mut keep = plan.keep.iter().copied().peekable();
    for item in plan.chunk.scan_forward(plan.chunk.header().start_position()) {
        let (record, _) = item?;
        let position = record.log_position();
        if keep.peek() == Some(&position) {
            keep.next();
            target.append_at(position, &encode_record(&record))?;
        }
    }
    match keep.next() {
        Some(position) => Err(Error::CorruptRecord {
            position,
            detail: "record disappeared while scavenging".to_string(),
        }),
        None => Ok(()),
    }
}

/// Keep rules for one record of a completed chunk.
fn should_keep(state: &IndexState, record: &LogRecord, now: u64) -> bool {
    match record {
        LogRecord::System(_) => true,
        LogRecord::Commit(commit) => {
            state.transaction_has_retained_event(commit.transaction_position, now)
        }
        LogRecord::Prepare(prepare) => {
            let Some(info) = state.commits.get(&prepare.transaction_position) else {
                // Open transactions may still commit.
                return !state.is_abandoned(prepare.transaction_position);
            };
            if !prepare.is_data() {
                return state.transaction_has_retained_event(prepare.transaction_position, now);
            }
            match info.event_number(prepare.transaction_offset) {
                Some(event_number) => state.is_event_retained(&info.stream_id, event_number, now),
                None => true,
            }
        }
    }
}

/// Run a scavenge pass every `interval` until `token` is cancelled.
///
/// Each pass runs on the blocking thread pool. The first pass starts after one
/// interval.
pub fn spawn_scavenger(
    scavenger: Scavenger,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let scavenger = Arc::new(scavenger);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
            let pass = Arc::clone(&scavenger);
            let pass_token = token.clone();
            match tokio::task::spawn_blocking(move || pass.scavenge(&pass_token)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "scavenge pass failed"),
                Err(e) => tracing::error!(error = %e, "scavenge task panicked"),
            }
            if token.is_cancelled() {
                break;
            }
        }
        tracing::debug!("scavenger stopped");
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use uuid::Uuid;

    use super::*;
    use crate::config::{MIN_CHUNK_SIZE, StorageConfig};
    use crate::store::Store;
    use crate::types::{ExpectedVersion, ProposedEvent, StreamMetadata, metastream_of};

    fn open_store(dir: &std::path::Path) -> Store {
        Store::open(&StorageConfig::new(dir).with_chunk_size(MIN_CHUNK_SIZE)).expect("open")
    }

    fn event(payload: usize) -> ProposedEvent {
        ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: "Tick".to_string(),
            is_json: false,
            data: Bytes::from(vec![b'x'; payload]),
            metadata: Bytes::new(),
        }
    }

    fn append_many(store: &mut Store, stream: &str, count: usize) {
        for _ in 0..count {
            store
                .append(stream, ExpectedVersion::Any, vec![event(64)])
                .expect("append");
        }
    }

    /// Write filler until the chunk holding everything so far is completed.
    fn roll_past_current_chunk(store: &mut Store) {
        let start_chunks = store.chunk_db().chunks().len();
        while store.chunk_db().chunks().len() == start_chunks {
            store
                .append("filler", ExpectedVersion::Any, vec![event(256)])
                .expect("filler");
        }
    }

    fn scavenger(store: &Store, merge_chunks: bool) -> Scavenger {
        Scavenger::new(
            store.chunk_db(),
            store.read_index(),
            ScavengeOptions { merge_chunks },
        )
    }

    fn stream_numbers(store: &Store, stream: &str) -> Vec<u64> {
        store
            .read_index()
            .read_stream_forward(stream, 0, 1000)
            .expect("read")
            .events
            .iter()
            .map(|e| e.event_number)
            .collect()
    }

    #[test]
    fn max_count_events_are_reclaimed_without_changing_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        let metadata = StreamMetadata {
            max_count: Some(3),
            ..StreamMetadata::default()
        };
        store
            .set_stream_metadata("capped", ExpectedVersion::Any, &metadata)
            .expect("metadata");
        append_many(&mut store, "capped", 20);
        roll_past_current_chunk(&mut store);

        let before = stream_numbers(&store, "capped");
        assert_eq!(before, vec![17, 18, 19]);

        let result = scavenger(&store, false)
            .scavenge(&CancellationToken::new())
            .expect("scavenge");
        assert!(result.chunks_scavenged >= 1);
        assert!(result.records_dropped >= 17);
        assert!(result.bytes_reclaimed > 0);
        assert_eq!(result.next_chunk, None);

        assert_eq!(stream_numbers(&store, "capped"), before);
        assert!(store.chunk_db().chunks()[0].is_scavenged());
        assert_eq!(store.chunk_db().chunks()[0].header().generation, 1);
    }

    #[test]
    fn nothing_to_drop_skips_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        append_many(&mut store, "plain", 5);
        roll_past_current_chunk(&mut store);

        let result = scavenger(&store, false)
            .scavenge(&CancellationToken::new())
            .expect("scavenge");
        assert_eq!(result.chunks_scavenged, 0);
        assert!(result.chunks_skipped >= 1);
        assert!(!store.chunk_db().chunks()[0].is_scavenged());
    }

    #[test]
    fn tail_chunk_is_never_touched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        let metadata = StreamMetadata {
            max_count: Some(1),
            ..StreamMetadata::default()
        };
        store
            .set_stream_metadata("short", ExpectedVersion::Any, &metadata)
            .expect("metadata");
        append_many(&mut store, "short", 3);
        assert_eq!(store.chunk_db().chunks().len(), 1);

        let result = scavenger(&store, false)
            .scavenge(&CancellationToken::new())
            .expect("scavenge");
        assert_eq!(result.chunks_scavenged, 0);
        assert_eq!(result.chunks_skipped, 0);
        assert_eq!(result.records_dropped, 0);
        assert_eq!(stream_numbers(&store, "short"), vec![2]);
    }

    #[test]
    fn hard_deleted_stream_keeps_only_tombstone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        append_many(&mut store, "doomed", 10);
        store
            .delete_stream("doomed", ExpectedVersion::Any, true)
            .expect("delete");
        roll_past_current_chunk(&mut store);

        let result = scavenger(&store, false)
            .scavenge(&CancellationToken::new())
            .expect("scavenge");
        assert!(result.records_dropped >= 10);

        let all = store
            .read_index()
            .read_all_forward(0, 10_000)
            .expect("read all");
        let doomed: Vec<&str> = all
            .events
            .iter()
            .filter(|e| e.stream_id == "doomed")
            .map(|e| e.event_type.as_str())
            .collect();
        assert_eq!(doomed, vec!["$streamDeleted"]);
    }

    #[test]
    fn metastream_compacts_to_latest_metaevent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for max_count in 1..=5u64 {
            let metadata = StreamMetadata {
                max_count: Some(max_count),
                ..StreamMetadata::default()
            };
            store
                .set_stream_metadata("configured", ExpectedVersion::Any, &metadata)
                .expect("metadata");
        }
        roll_past_current_chunk(&mut store);
        scavenger(&store, false)
            .scavenge(&CancellationToken::new())
            .expect("scavenge");

        let index = store.read_index();
        assert_eq!(stream_numbers(&store, &metastream_of("configured")), vec![4]);
        let meta = index.get_stream_metadata("configured").expect("metadata");
        assert_eq!(meta.metadata.max_count, Some(5));
        assert_eq!(meta.metastream_version, Some(4));
    }

    #[test]
    fn soft_deleted_stream_keeps_its_last_event_for_the_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut store = open_store(dir.path());
            append_many(&mut store, "soft", 6);
            store
                .delete_stream("soft", ExpectedVersion::Exact(5), false)
                .expect("soft delete");
            roll_past_current_chunk(&mut store);

            let result = scavenger(&store, false)
                .scavenge(&CancellationToken::new())
                .expect("scavenge");
            assert!(result.records_dropped >= 5);
            assert!(stream_numbers(&store, "soft").is_empty());
            store.close().expect("close");
        }

        let mut store = open_store(dir.path());
        assert_eq!(store.read_index().stream_version("soft"), Some(5));
        assert!(stream_numbers(&store, "soft").is_empty());
        store
            .append("soft", ExpectedVersion::Exact(5), vec![event(8)])
            .expect("append after reopen");
        assert_eq!(stream_numbers(&store, "soft"), vec![6]);
    }

    #[test]
    fn rejected_prepares_are_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for _ in 0..20 {
            let err = store
                .append("contended", ExpectedVersion::Exact(99), vec![event(64)])
                .expect_err("stream has no version 99");
            assert!(matches!(err, Error::WrongExpectedVersion { .. }), "got {err:?}");
        }
        assert_eq!(store.read_index().pending_transactions(), 0);
        roll_past_current_chunk(&mut store);

        let result = scavenger(&store, false)
            .scavenge(&CancellationToken::new())
            .expect("scavenge");
        assert!(result.records_dropped >= 20);
        assert!(matches!(
            store.read_index().read_stream_forward("contended", 0, 10),
            Err(Error::StreamNotFound { .. })
        ));
    }

    #[test]
    fn cancelled_token_stops_before_first_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        roll_past_current_chunk(&mut store);

        let token = CancellationToken::new();
        token.cancel();
        let result = scavenger(&store, false).scavenge(&token).expect("scavenge");
        assert_eq!(result.next_chunk, Some(0));
        assert_eq!(result.chunks_scavenged, 0);
        assert_eq!(result.chunks_skipped, 0);
    }

    #[test]
    fn merge_combines_scavenged_chunks_and_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut store = open_store(dir.path());
            let metadata = StreamMetadata {
                max_count: Some(1),
                ..StreamMetadata::default()
            };
            store
                .set_stream_metadata("churn", ExpectedVersion::Any, &metadata)
                .expect("metadata");
            while store.chunk_db().chunks().len() < 4 {
                append_many(&mut store, "churn", 1);
            }
            roll_past_current_chunk(&mut store);
            let chunks_before = store.chunk_db().chunks().len();

            let result = scavenger(&store, true)
                .scavenge(&CancellationToken::new())
                .expect("scavenge");
            assert!(result.chunks_scavenged >= 2);
            assert!(store.chunk_db().chunks().len() < chunks_before);
            assert_eq!(stream_numbers(&store, "churn").len(), 1);
            store.close().expect("close");
        }

        let store = open_store(dir.path());
        let index = store.read_index();
        let last = index.stream_version("churn").expect("stream exists");
        assert_eq!(stream_numbers(&store, "churn"), vec![last]);
        let meta = index.get_stream_metadata("churn").expect("metadata");
        assert_eq!(meta.metadata.max_count, Some(1));
    }

    #[tokio::test]
    async fn spawned_scavenger_stops_on_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let token = CancellationToken::new();
        let handle = spawn_scavenger(
            scavenger(&store, false),
            Duration::from_millis(10),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scavenger stops")
            .expect("no panic");
    }
}
