//! The read index: committed stream state derived from the log.
//!
//! [`IndexState`] maps `(stream, event number)` to the log positions of committed
//! data prepares, tracks hard-deleted streams, remembers which transactions were
//! committed where, and caches the latest metadata of every stream. It is rebuilt by
//! replaying the log at open and then updated by the writer after every flush.
//!
//! [`ReadIndex`] is the shared, cloneable read handle: an `Arc<RwLock<IndexState>>`
//! plus the chunk database the event payloads are read from. Readers hold the lock
//! only while resolving positions; record payloads are read from the chunks after the
//! guard is released.
//!
//! Visibility rules applied to every read:
//! - uncommitted prepares are never visible;
//! - a hard-deleted stream only exposes its tombstone (through `$all`); stream reads
//!   fail with [`Error::StreamDeleted`];
//! - events below `$tb` are hidden;
//! - events outside `$maxCount` or older than `$maxAge` are hidden, except for the
//!   stream's last event;
//! - a metastream behaves as if `$maxCount = 1`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use uuid::Uuid;

use crate::chunk_db::ChunkDb;
use crate::codec::{CommitLogRecord, LogRecord, PrepareLogRecord};
use crate::dedup::DedupIndex;
use crate::error::Error;
use crate::types::{
    AllSlice, METADATA_EVENT_TYPE, PrepareFlags, RecordedEvent, StreamInfo, StreamMetadata,
    StreamMetadataResult, StreamSlice, is_metastream, metastream_of, now_millis,
    original_stream_of,
};

/// Position of one committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    /// Position of the data prepare.
    pub log_position: u64,
    /// Position of the commit that assigned the event number.
    pub commit_position: u64,
    /// Position of the transaction's first prepare.
    pub transaction_position: u64,
    pub event_id: Uuid,
    /// Prepare timestamp, unix ms.
    pub timestamp: u64,
}

/// Committed state of one stream.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamIndex {
    pub entries: BTreeMap<u64, IndexEntry>,
    pub last_event_number: Option<u64>,
    pub deleted: bool,
}

/// Where and what a transaction committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitInfo {
    pub commit_position: u64,
    pub stream_id: String,
    pub first_event_number: u64,
    /// Number of event numbers the commit assigned.
    pub event_count: u64,
}

impl CommitInfo {
    /// Event number of the data prepare with `transaction_offset`.
    pub fn event_number(&self, transaction_offset: i32) -> Option<u64> {
        u64::try_from(transaction_offset)
            .ok()
            .map(|offset| self.first_event_number + offset)
    }
}

/// A prepare waiting for its commit.
#[derive(Debug, Clone)]
struct PendingPrepare {
    log_position: u64,
    transaction_offset: i32,
    flags: PrepareFlags,
    stream_id: String,
    event_id: Uuid,
    timestamp: u64,
    /// Payload, kept only for `$metadata` events on metastreams.
    metadata_payload: Option<Bytes>,
}

/// In-memory committed state of the log.
#[derive(Debug)]
pub struct IndexState {
    pub(crate) streams: HashMap<String, StreamIndex>,
    /// Committed transactions by transaction position.
    pub(crate) commits: HashMap<u64, CommitInfo>,
    /// Uncommitted prepares by transaction position.
    pending: BTreeMap<u64, Vec<PendingPrepare>>,
    /// Transactions whose commit was rejected; their prepares can never commit.
    aborted: HashSet<u64>,
    /// Position of the current epoch record. Uncommitted transactions below it
    /// belong to an earlier run and can never commit.
    epoch_position: u64,
    /// Committed data prepares in log order: position -> (stream, event number).
    pub(crate) all: BTreeMap<u64, (String, u64)>,
    /// Latest metadata per (non-meta) stream, with the metastream event number.
    metadata: HashMap<String, (u64, StreamMetadata)>,
    pub(crate) dedup: DedupIndex,
    /// Log position up to which records have been applied.
    indexed_position: u64,
}

impl IndexState {
    /// An empty index whose dedup cache tracks `dedup_capacity` event ids.
    pub fn new(dedup_capacity: NonZeroUsize) -> IndexState {
        IndexState {
            streams: HashMap::new(),
            commits: HashMap::new(),
            pending: BTreeMap::new(),
            aborted: HashSet::new(),
            epoch_position: 0,
            all: BTreeMap::new(),
            metadata: HashMap::new(),
            dedup: DedupIndex::new(dedup_capacity),
            indexed_position: 0,
        }
    }

    /// Build the index by replaying every record below the Writer position.
    ///
    /// # Errors
    ///
    /// Returns the first read or decode error from the log.
    pub fn rebuild(db: &ChunkDb, dedup_capacity: NonZeroUsize) -> Result<IndexState, Error> {
        let mut state = IndexState::new(dedup_capacity);
        let horizon = db.writer_position();
        let mut records = 0u64;
        for item in db.scan_forward(0, horizon) {
            let (record, next) = item?;
            state.index_record(&record);
            state.indexed_position = next;
            records += 1;
        }
        state.indexed_position = horizon;

        tracing::info!(
            records,
            streams = state.streams.len(),
            events = state.all.len(),
            uncommitted_transactions = state.pending.len(),
            "rebuilt read index"
        );
        Ok(state)
    }

    /// Position up to which records have been applied.
    pub fn indexed_position(&self) -> u64 {
        self.indexed_position
    }

    /// Record that everything below `position` has been applied.
    pub fn set_indexed_position(&mut self, position: u64) {
        self.indexed_position = self.indexed_position.max(position);
    }

    /// Number of transactions with prepares but no commit yet.
    pub fn pending_transactions(&self) -> usize {
        self.pending.len()
    }

    /// Mark the transaction at `transaction_position` as never committing and drop
    /// its buffered prepares. No-op for a committed transaction.
    pub fn abort_transaction(&mut self, transaction_position: u64) {
        if self.commits.contains_key(&transaction_position) {
            return;
        }
        self.pending.remove(&transaction_position);
        self.aborted.insert(transaction_position);
    }

    /// Record the position of the current epoch record and drop the buffered
    /// prepares of uncommitted transactions that began before it.
    pub fn set_epoch_position(&mut self, position: u64) {
        self.epoch_position = position;
        let before = self.pending.len();
        self.pending = self.pending.split_off(&position);
        self.aborted.retain(|tp| *tp >= position);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            tracing::info!(
                dropped,
                epoch_position = position,
                "discarded uncommitted transactions from earlier epochs"
            );
        }
    }

    /// `true` if the transaction at `transaction_position` is uncommitted and can
    /// never commit: its commit was rejected, or it began before the current epoch.
    pub fn is_abandoned(&self, transaction_position: u64) -> bool {
        !self.commits.contains_key(&transaction_position)
            && (self.aborted.contains(&transaction_position)
                || transaction_position < self.epoch_position)
    }

    /// Apply one record. Prepares are buffered; a commit makes its transaction's
    /// data prepares visible. System records carry no stream state.
    pub fn index_record(&mut self, record: &LogRecord) {
        match record {
            LogRecord::Prepare(prepare) => self.index_prepare(prepare),
            LogRecord::Commit(commit) => self.index_commit(commit),
            LogRecord::System(_) => {}
        }
    }

    fn index_prepare(&mut self, prepare: &PrepareLogRecord) {
        let metadata_payload = (is_metastream(&prepare.stream_id)
            && prepare.event_type == METADATA_EVENT_TYPE)
            .then(|| prepare.data.clone());
        self.pending
            .entry(prepare.transaction_position)
            .or_default()
            .push(PendingPrepare {
                log_position: prepare.log_position,
                transaction_offset: prepare.transaction_offset,
                flags: prepare.flags,
                stream_id: prepare.stream_id.clone(),
                event_id: prepare.event_id,
                timestamp: prepare.timestamp,
                metadata_payload,
            });
    }

    fn index_commit(&mut self, commit: &CommitLogRecord) {
        let Some(prepares) = self.pending.remove(&commit.transaction_position) else {
            tracing::debug!(
                commit_position = commit.log_position,
                transaction_position = commit.transaction_position,
                "commit without remaining prepares"
            );
            return;
        };
        let Some(stream_id) = prepares.first().map(|p| p.stream_id.clone()) else {
            return;
        };

        let mut event_count = 0u64;
        for prepare in prepares
            .iter()
            .filter(|p| p.flags.contains(PrepareFlags::DATA))
        {
            let Ok(offset) = u64::try_from(prepare.transaction_offset) else {
                continue;
            };
            let event_number = commit.first_event_number + offset;
            event_count = event_count.max(offset + 1);

            let stream = self.streams.entry(stream_id.clone()).or_default();
            stream.entries.insert(
                event_number,
                IndexEntry {
                    log_position: prepare.log_position,
                    commit_position: commit.log_position,
                    transaction_position: commit.transaction_position,
                    event_id: prepare.event_id,
                    timestamp: prepare.timestamp,
                },
            );
            stream.last_event_number = Some(
                stream
                    .last_event_number
                    .map_or(event_number, |last| last.max(event_number)),
            );
            if prepare.flags.contains(PrepareFlags::STREAM_DELETE) {
                stream.deleted = true;
            }

            self.all
                .insert(prepare.log_position, (stream_id.clone(), event_number));
            self.dedup.record(prepare.event_id, &stream_id, event_number);

            if let Some(payload) = &prepare.metadata_payload {
                self.cache_metadata(&stream_id, event_number, payload);
            }
        }

        self.commits.insert(
            commit.transaction_position,
            CommitInfo {
                commit_position: commit.log_position,
                stream_id,
                first_event_number: commit.first_event_number,
                event_count,
            },
        );
    }

    fn cache_metadata(&mut self, metastream_id: &str, event_number: u64, payload: &[u8]) {
        let Some(stream_id) = original_stream_of(metastream_id) else {
            return;
        };
        let current = self.metadata.get(stream_id).map(|(version, _)| *version);
        if current.is_some_and(|version| version > event_number) {
            return;
        }
        match StreamMetadata::from_json(payload) {
            Ok(metadata) => {
                self.metadata
                    .insert(stream_id.to_string(), (event_number, metadata));
            }
            Err(e) => tracing::warn!(
                stream_id,
                event_number,
                error = %e,
                "ignoring unparseable stream metadata"
            ),
        }
    }

    /// Metadata in effect for `stream_id`.
    pub(crate) fn effective_metadata(&self, stream_id: &str) -> StreamMetadata {
        if is_metastream(stream_id) {
            return StreamMetadata::for_metastream();
        }
        self.metadata
            .get(stream_id)
            .map(|(_, metadata)| metadata.clone())
            .unwrap_or_default()
    }

    /// Whether committed event `event_number` of `stream_id` is still visible at
    /// `now` (unix ms). Unknown streams and events are not live.
    pub(crate) fn is_event_live(&self, stream_id: &str, event_number: u64, now: u64) -> bool {
        let Some(stream) = self.streams.get(stream_id) else {
            return false;
        };
        let Some(entry) = stream.entries.get(&event_number) else {
            return false;
        };
        is_live(
            stream,
            &self.effective_metadata(stream_id),
            event_number,
            entry.timestamp,
            now,
        )
    }

    /// Whether the record of committed event `event_number` must stay in the log:
    /// it is live, or it is the stream's last event, which carries the stream
    /// version across an index rebuild even when `$tb` hides it.
    pub(crate) fn is_event_retained(&self, stream_id: &str, event_number: u64, now: u64) -> bool {
        let is_last = self
            .streams
            .get(stream_id)
            .and_then(|stream| stream.last_event_number)
            == Some(event_number);
        is_last || self.is_event_live(stream_id, event_number, now)
    }

    /// Whether any event committed by the transaction at `transaction_position` is
    /// retained. Transactions that committed no events count as retained.
    pub(crate) fn transaction_has_retained_event(
        &self,
        transaction_position: u64,
        now: u64,
    ) -> bool {
        let Some(commit) = self.commits.get(&transaction_position) else {
            return true;
        };
        if commit.event_count == 0 {
            return true;
        }
        (commit.first_event_number..commit.first_event_number + commit.event_count)
            .any(|n| self.is_event_retained(&commit.stream_id, n, now))
    }
}

/// Visibility of one event of `stream`, given the metadata in effect.
fn is_live(
    stream: &StreamIndex,
    metadata: &StreamMetadata,
    event_number: u64,
    timestamp: u64,
    now: u64,
) -> bool {
    let Some(last) = stream.last_event_number else {
        return false;
    };
    if stream.deleted {
        return event_number == last;
    }
    if metadata
        .truncate_before
        .is_some_and(|truncate_before| event_number < truncate_before)
    {
        return false;
    }
    // `$maxCount` and `$maxAge` never hide the current version.
    if event_number == last {
        return true;
    }
    event_number >= metadata.first_visible(last) && !metadata.is_expired(timestamp, now)
}

/// Build the client-facing event from a committed data prepare.
pub(crate) fn recorded_event(
    prepare: PrepareLogRecord,
    event_number: u64,
    commit_position: u64,
) -> RecordedEvent {
    RecordedEvent {
        is_json: prepare.flags.contains(PrepareFlags::IS_JSON),
        stream_id: prepare.stream_id,
        event_id: prepare.event_id,
        event_number,
        log_position: prepare.log_position,
        commit_position,
        recorded_at: prepare.timestamp,
        event_type: prepare.event_type,
        data: prepare.data,
        metadata: prepare.metadata,
    }
}

/// Shared, read-only handle to the read index.
///
/// Cloning produces a new handle to the same state. Held by readers, the commit
/// validator, the scavenger and subscriptions.
#[derive(Clone, Debug)]
pub struct ReadIndex {
    pub(crate) state: Arc<RwLock<IndexState>>,
    pub(crate) db: Arc<ChunkDb>,
}

/// A committed event resolved under the lock, loaded after it is released.
struct Located {
    stream_id: String,
    event_number: u64,
    entry: IndexEntry,
}

impl ReadIndex {
    /// Create a handle over `state`, reading payloads from `db`.
    pub fn new(state: Arc<RwLock<IndexState>>, db: Arc<ChunkDb>) -> ReadIndex {
        ReadIndex { state, db }
    }

    /// Position the next record will be written at.
    pub fn writer_position(&self) -> u64 {
        self.db.writer_position()
    }

    /// Log position up to which records are reflected in the index. Every commit
    /// below it is visible to reads.
    pub fn indexed_position(&self) -> u64 {
        self.state
            .read()
            .expect("IndexState RwLock poisoned")
            .indexed_position()
    }

    /// Number of transactions with prepares but no commit yet.
    pub fn pending_transactions(&self) -> usize {
        self.state
            .read()
            .expect("IndexState RwLock poisoned")
            .pending_transactions()
    }

    /// The chunk database this index reads from.
    pub fn chunk_db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    /// Last event number of the stream, `None` if it has no events.
    pub fn stream_version(&self, stream_id: &str) -> Option<u64> {
        let state = self.state.read().expect("IndexState RwLock poisoned");
        state
            .streams
            .get(stream_id)
            .and_then(|stream| stream.last_event_number)
    }

    /// `true` if the stream was hard-deleted.
    pub fn is_deleted(&self, stream_id: &str) -> bool {
        let state = self.state.read().expect("IndexState RwLock poisoned");
        state
            .streams
            .get(stream_id)
            .is_some_and(|stream| stream.deleted)
    }

    /// Summary of every stream with committed events, sorted by stream id.
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        let state = self.state.read().expect("IndexState RwLock poisoned");
        let mut streams: Vec<StreamInfo> = state
            .streams
            .iter()
            .filter_map(|(id, stream)| {
                stream.last_event_number.map(|last| StreamInfo {
                    stream_id: id.clone(),
                    last_event_number: last,
                    deleted: stream.deleted,
                })
            })
            .collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }

    /// Read a single event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] for an unknown stream,
    /// [`Error::StreamDeleted`] for a hard-deleted one, and [`Error::EventNotFound`]
    /// if the event does not exist, is hidden by metadata, or was scavenged.
    pub fn read_event(&self, stream_id: &str, event_number: u64) -> Result<RecordedEvent, Error> {
        let located = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let stream = readable_stream(&state, stream_id)?;
            let now = now_millis();
            let metadata = state.effective_metadata(stream_id);
            stream
                .entries
                .get(&event_number)
                .filter(|entry| is_live(stream, &metadata, event_number, entry.timestamp, now))
                .map(|entry| Located {
                    stream_id: stream_id.to_string(),
                    event_number,
                    entry: *entry,
                })
        };
        let not_found = || Error::EventNotFound {
            stream_id: stream_id.to_string(),
            event_number,
        };
        match located {
            Some(located) => self.load(located)?.ok_or_else(not_found),
            None => Err(not_found()),
        }
    }

    /// Read up to `max_count` event numbers forward from `from`.
    ///
    /// Event numbers hidden by metadata are skipped, so a page may hold fewer than
    /// `max_count` events without being the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] or [`Error::StreamDeleted`].
    pub fn read_stream_forward(
        &self,
        stream_id: &str,
        from: u64,
        max_count: u64,
    ) -> Result<StreamSlice, Error> {
        let (located, next_event_number, last_event_number) = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let stream = readable_stream(&state, stream_id)?;
            let last = stream.last_event_number.unwrap_or(0);
            let metadata = state.effective_metadata(stream_id);
            let start = from.max(metadata.first_visible(last));
            let end = start.saturating_add(max_count).min(last + 1).max(start);
            let now = now_millis();
            let located: Vec<Located> = stream
                .entries
                .range(start..end)
                .filter(|(n, entry)| is_live(stream, &metadata, **n, entry.timestamp, now))
                .map(|(n, entry)| Located {
                    stream_id: stream_id.to_string(),
                    event_number: *n,
                    entry: *entry,
                })
                .collect();
            (located, end, last)
        };

        Ok(StreamSlice {
            stream_id: stream_id.to_string(),
            events: self.load_all(located)?,
            next_event_number,
            last_event_number,
            is_end_of_stream: next_event_number > last_event_number,
        })
    }

    /// Read up to `max_count` event numbers backward from `from` (inclusive).
    ///
    /// `from = None` starts at the last event. When the slice reaches the first
    /// visible event, `is_end_of_stream` is set and `next_event_number` is 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] or [`Error::StreamDeleted`].
    pub fn read_stream_backward(
        &self,
        stream_id: &str,
        from: Option<u64>,
        max_count: u64,
    ) -> Result<StreamSlice, Error> {
        let (located, next_event_number, is_end_of_stream, last_event_number) = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let stream = readable_stream(&state, stream_id)?;
            let last = stream.last_event_number.unwrap_or(0);
            let metadata = state.effective_metadata(stream_id);
            let first_visible = metadata.first_visible(last);
            let start = from.unwrap_or(last).min(last);

            if start < first_visible {
                (Vec::new(), 0, true, last)
            } else if max_count == 0 {
                (Vec::new(), start, false, last)
            } else {
                let low = (start + 1).saturating_sub(max_count).max(first_visible);
                let now = now_millis();
                let located: Vec<Located> = stream
                    .entries
                    .range(low..=start)
                    .rev()
                    .filter(|(n, entry)| is_live(stream, &metadata, **n, entry.timestamp, now))
                    .map(|(n, entry)| Located {
                        stream_id: stream_id.to_string(),
                        event_number: *n,
                        entry: *entry,
                    })
                    .collect();
                let is_end = low <= first_visible;
                let next = if is_end { 0 } else { low - 1 };
                (located, next, is_end, last)
            }
        };

        Ok(StreamSlice {
            stream_id: stream_id.to_string(),
            events: self.load_all(located)?,
            next_event_number,
            last_event_number,
            is_end_of_stream,
        })
    }

    /// Read committed events of all streams in log position order, starting at
    /// `from` (inclusive), examining at most `max_count` events.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read from its chunk.
    pub fn read_all_forward(&self, from: u64, max_count: usize) -> Result<AllSlice, Error> {
        let (located, next_position, is_end_of_stream) = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let now = now_millis();
            let mut next_position = from;
            let mut located = Vec::new();
            for (position, (stream_id, event_number)) in state.all.range(from..).take(max_count) {
                next_position = position + 1;
                if let Some(found) = locate_visible(&state, stream_id, *event_number, now) {
                    located.push(found);
                }
            }
            let is_end = state.all.range(next_position..).next().is_none();
            (located, next_position, is_end)
        };

        Ok(AllSlice {
            events: self.load_all(located)?,
            next_position,
            is_end_of_stream,
        })
    }

    /// Read committed events of all streams in reverse log order, starting below
    /// `before` (exclusive; `None` = the Writer position).
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read from its chunk.
    pub fn read_all_backward(
        &self,
        before: Option<u64>,
        max_count: usize,
    ) -> Result<AllSlice, Error> {
        let before = before.unwrap_or_else(|| self.writer_position());
        let (located, next_position, is_end_of_stream) = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let now = now_millis();
            let mut next_position = before;
            let mut located = Vec::new();
            for (position, (stream_id, event_number)) in
                state.all.range(..before).rev().take(max_count)
            {
                next_position = *position;
                if let Some(found) = locate_visible(&state, stream_id, *event_number, now) {
                    located.push(found);
                }
            }
            let is_end = state.all.range(..next_position).next_back().is_none();
            (located, next_position, is_end)
        };

        Ok(AllSlice {
            events: self.load_all(located)?,
            next_position,
            is_end_of_stream,
        })
    }

    /// Current metadata of `stream_id` (default if none was ever written).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when asked for the metadata of a
    /// metastream.
    pub fn get_stream_metadata(&self, stream_id: &str) -> Result<StreamMetadataResult, Error> {
        if is_metastream(stream_id) {
            return Err(Error::InvalidArgument(format!(
                "metastream {stream_id} has no metadata of its own"
            )));
        }
        let state = self.state.read().expect("IndexState RwLock poisoned");
        let (metastream_version, metadata) = match state.metadata.get(stream_id) {
            Some((version, metadata)) => (Some(*version), metadata.clone()),
            None => (None, StreamMetadata::default()),
        };
        Ok(StreamMetadataResult {
            stream_id: stream_id.to_string(),
            metastream_version,
            metadata,
        })
    }

    /// Current version of the metastream of `stream_id`.
    pub fn metastream_version(&self, stream_id: &str) -> Option<u64> {
        self.stream_version(&metastream_of(stream_id))
    }

    /// Committed events of the transaction that began at `transaction_position`, in
    /// event number order. Scavenged events are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read.
    pub(crate) fn committed_events(
        &self,
        transaction_position: u64,
    ) -> Result<Vec<RecordedEvent>, Error> {
        let located = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let Some(commit) = state.commits.get(&transaction_position) else {
                return Ok(Vec::new());
            };
            let Some(stream) = state.streams.get(&commit.stream_id) else {
                return Ok(Vec::new());
            };
            stream
                .entries
                .range(commit.first_event_number..commit.first_event_number + commit.event_count)
                .filter(|(_, entry)| entry.transaction_position == transaction_position)
                .map(|(n, entry)| Located {
                    stream_id: commit.stream_id.clone(),
                    event_number: *n,
                    entry: *entry,
                })
                .collect()
        };
        self.load_all(located)
    }

    /// Committed events of `stream_id` numbered `from..from + count`, skipping any
    /// that no longer exist.
    pub(crate) fn events_in_range(
        &self,
        stream_id: &str,
        from: u64,
        count: u64,
    ) -> Result<Vec<RecordedEvent>, Error> {
        let located = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let Some(stream) = state.streams.get(stream_id) else {
                return Ok(Vec::new());
            };
            stream
                .entries
                .range(from..from.saturating_add(count))
                .map(|(n, entry)| Located {
                    stream_id: stream_id.to_string(),
                    event_number: *n,
                    entry: *entry,
                })
                .collect()
        };
        self.load_all(located)
    }

    fn load_all(&self, located: Vec<Located>) -> Result<Vec<RecordedEvent>, Error> {
        let mut events = Vec::with_capacity(located.len());
        for item in located {
            if let Some(event) = self.load(item)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Read the prepare behind an index entry. `None` if it was scavenged.
    fn load(&self, located: Located) -> Result<Option<RecordedEvent>, Error> {
        match self.db.read_record(located.entry.log_position)? {
            Some(LogRecord::Prepare(prepare)) => {
                if prepare.stream_id != located.stream_id {
                    return Err(Error::CorruptRecord {
                        position: located.entry.log_position,
                        detail: format!(
                            "indexed for stream {}, prepare belongs to {}",
                            located.stream_id, prepare.stream_id
                        ),
                    });
                }
                Ok(Some(recorded_event(
                    prepare,
                    located.event_number,
                    located.entry.commit_position,
                )))
            }
            Some(other) => Err(Error::CorruptRecord {
                position: located.entry.log_position,
                detail: format!("expected a prepare, found {other:?}"),
            }),
            None => Ok(None),
        }
    }
}

fn readable_stream<'a>(state: &'a IndexState, stream_id: &str) -> Result<&'a StreamIndex, Error> {
    let stream = state
        .streams
        .get(stream_id)
        .filter(|stream| stream.last_event_number.is_some())
        .ok_or_else(|| Error::StreamNotFound {
            stream_id: stream_id.to_string(),
        })?;
    if stream.deleted {
        return Err(Error::StreamDeleted {
            stream_id: stream_id.to_string(),
        });
    }
    Ok(stream)
}

fn locate_visible(
    state: &IndexState,
    stream_id: &str,
    event_number: u64,
    now: u64,
) -> Option<Located> {
    let stream = state.streams.get(stream_id)?;
    let entry = stream.entries.get(&event_number)?;
    let metadata = state.effective_metadata(stream_id);
    is_live(stream, &metadata, event_number, entry.timestamp, now).then(|| Located {
        stream_id: stream_id.to_string(),
        event_number,
        entry: *entry,
    })
}
