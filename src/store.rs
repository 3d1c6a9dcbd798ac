//! Storage engine for EventfoldDB.
//!
//! The `Store` owns the chunk database, the checkpoints and the read index. Every
//! write follows the prepare/commit protocol:
//!
//! 1. Prepares are appended at the Writer position (not yet fsynced).
//! 2. The commit validator decides at the Writer's non-flushed horizon.
//! 3. On `Ok` a commit record assigns event numbers.
//! 4. Chunk data and the Writer checkpoint are fsynced.
//! 5. The new records are applied to the read index and the Chaser advances.
//!
//! Only then is the caller answered. A `Store` is owned by exactly one writer (see
//! [`crate::writer`]); readers use [`ReadIndex`] handles.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use metrics::{counter, gauge};
use uuid::Uuid;

use crate::checkpoint::Checkpoints;
use crate::chunk_db::ChunkDb;
use crate::codec::{
    CommitLogRecord, EpochRecord, LogRecord, PrepareLogRecord, SystemLogRecord, SystemRecordKind,
};
use crate::commit::CommitDecision;
use crate::config::StorageConfig;
use crate::error::Error;
use crate::index::{IndexState, ReadIndex};
use crate::types::{
    AppendResult, DeleteResult, ExpectedVersion, MAX_EVENT_SIZE, MAX_EVENT_TYPE_LEN,
    MAX_STREAM_ID_LEN, METADATA_EVENT_TYPE, PrepareFlags, ProposedEvent, RecordedEvent,
    STREAM_DELETED_EVENT_TYPE, StreamMetadata, is_metastream, metastream_of, now_millis,
};

/// Result of committing a prepared transaction with [`Store::write_commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// The validator's decision.
    pub decision: CommitDecision,
    /// Position of the commit record written (or found, for an idempotent retry).
    pub commit_position: Option<u64>,
    /// Events made visible by this commit. Empty unless a commit was written.
    pub events: Vec<RecordedEvent>,
}

/// An explicit transaction between `start_transaction` and `commit_transaction`.
#[derive(Debug, Clone)]
struct OpenTransaction {
    stream_id: String,
    expected_version: ExpectedVersion,
    next_offset: i32,
}

/// Core storage engine: the chunked log, its checkpoints and the read index.
pub struct Store {
    config: StorageConfig,
    db: Arc<ChunkDb>,
    state: Arc<RwLock<IndexState>>,
    index: ReadIndex,
    /// Records appended since the last flush, in log order.
    unflushed: Vec<LogRecord>,
    transactions: HashMap<u64, OpenTransaction>,
    /// Events committed since the last `take_committed`.
    committed: Vec<RecordedEvent>,
    epoch: EpochRecord,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("data_dir", &self.config.data_dir)
            .field("writer", &self.db.writer_position())
            .field("epoch", &self.epoch.epoch_number)
            .finish()
    }
}

impl Store {
    /// Open or create the store in `config.data_dir`.
    ///
    /// Recovers the chunk database (truncating a torn trailing record, see
    /// [`ChunkDb::open`]), rebuilds the read index by replaying the log, then
    /// writes a new epoch record and points the Epoch checkpoint at it.
    ///
    /// # Arguments
    ///
    /// * `config` - Storage options.
    ///
    /// # Returns
    ///
    /// A `Store` ready to accept writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on I/O failure, [`Error::InvalidHeader`] for an
    /// inconsistent directory and [`Error::CorruptRecord`] on mid-chunk corruption.
    pub fn open(config: &StorageConfig) -> Result<Store, Error> {
        std::fs::create_dir_all(&config.data_dir)?;
        let checkpoints = Checkpoints::open(&config.data_dir)?;
        let db = Arc::new(ChunkDb::open(&config.data_dir, config, checkpoints)?);

        let capacity = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        let state = IndexState::rebuild(&db, capacity)?;
        let checkpoints = db.checkpoints();
        checkpoints.chaser.write(state.indexed_position() as i64);
        checkpoints.chaser.flush()?;

        let previous_epoch = read_epoch(&db)?;
        let state = Arc::new(RwLock::new(state));
        let index = ReadIndex::new(Arc::clone(&state), Arc::clone(&db));
        let mut store = Store {
            config: config.clone(),
            db,
            state,
            index,
            unflushed: Vec::new(),
            transactions: HashMap::new(),
            committed: Vec::new(),
            epoch: EpochRecord {
                epoch_number: 0,
                epoch_id: Uuid::nil(),
                previous_epoch_position: None,
            },
        };
        store.write_epoch(previous_epoch)?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            writer = store.db.writer_position(),
            epoch = store.epoch.epoch_number,
            "opened store"
        );
        Ok(store)
    }

    /// Cheap handle for concurrent reads.
    pub fn read_index(&self) -> ReadIndex {
        self.index.clone()
    }

    /// The underlying chunk database (shared with the scavenger).
    pub fn chunk_db(&self) -> Arc<ChunkDb> {
        Arc::clone(&self.db)
    }

    /// Options the store was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Position the next record will be written at.
    pub fn writer_position(&self) -> u64 {
        self.db.writer_position()
    }

    /// The epoch written when this store was opened.
    pub fn epoch(&self) -> &EpochRecord {
        &self.epoch
    }

    /// Drain the events committed since the previous call, in commit order.
    ///
    /// The writer task publishes these after each request.
    pub fn take_committed(&mut self) -> Vec<RecordedEvent> {
        std::mem::take(&mut self.committed)
    }

    /// Append `events` to `stream_id` as one transaction.
    ///
    /// Writes one prepare per event, validates at the Writer horizon and, if the
    /// decision is `Ok`, commits. An empty `events` only checks the expected version.
    /// A retry of an already committed write is answered with `idempotent = true`
    /// and writes no commit.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream.
    /// * `expected_version` - Optimistic concurrency check.
    /// * `events` - Events to append.
    ///
    /// # Returns
    ///
    /// The [`AppendResult`] with the commit position and assigned event numbers.
    ///
    /// # Errors
    ///
    /// - [`Error::WrongExpectedVersion`] if the concurrency check fails.
    /// - [`Error::StreamDeleted`] if the stream was hard-deleted.
    /// - [`Error::CorruptedIdempotency`] if a retry differs from what was committed.
    /// - [`Error::InvalidArgument`] for an invalid stream id or event type.
    /// - [`Error::EventTooLarge`] if an event exceeds [`MAX_EVENT_SIZE`].
    /// - [`Error::Io`] if writing to the log fails.
    pub fn append(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendResult, Error> {
        validate_stream_id(stream_id)?;
        for event in &events {
            validate_event(event)?;
        }
        if self.index.is_deleted(stream_id) {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            });
        }

        if events.is_empty() {
            let current = self.index.stream_version(stream_id);
            if !expected_version.matches(current) {
                return Err(Error::WrongExpectedVersion {
                    stream_id: stream_id.to_string(),
                    expected: expected_version,
                    current,
                });
            }
            return Ok(AppendResult {
                position: None,
                event_range: None,
                events: Vec::new(),
                idempotent: false,
            });
        }

        let count = events.len();
        let mut transaction_position = None;
        for (offset, event) in events.into_iter().enumerate() {
            let flags = PrepareFlags::DATA
                .with(PrepareFlags::TRANSACTION_BEGIN, offset == 0)
                .with(PrepareFlags::TRANSACTION_END, offset + 1 == count)
                .with(PrepareFlags::IS_JSON, event.is_json);
            let position = self.write_prepare_record(
                stream_id,
                expected_version,
                transaction_position,
                offset as i32,
                flags,
                event,
            )?;
            transaction_position.get_or_insert(position);
        }

        let transaction_position = transaction_position.ok_or_else(|| {
            Error::InvalidArgument("append wrote no prepares".to_string())
        })?;
        let outcome = self.commit_at(transaction_position)?;
        outcome_to_result(outcome)
    }

    /// Write a single self-contained prepare without validating it.
    ///
    /// The low-level half of the protocol: the prepare is durable when this returns,
    /// but its event stays invisible until [`Store::write_commit`] succeeds.
    ///
    /// # Returns
    ///
    /// The prepare's log position, which is also its transaction position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] / [`Error::EventTooLarge`] for invalid
    /// input and [`Error::Io`] on write failure.
    pub fn write_prepare(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        event: ProposedEvent,
    ) -> Result<u64, Error> {
        validate_stream_id(stream_id)?;
        validate_event(&event)?;
        let flags = PrepareFlags::DATA
            | PrepareFlags::TRANSACTION_BEGIN
            | PrepareFlags::TRANSACTION_END;
        let flags = flags.with(PrepareFlags::IS_JSON, event.is_json);
        let position =
            self.write_prepare_record(stream_id, expected_version, None, 0, flags, event)?;
        self.flush_and_index()?;
        Ok(position)
    }

    /// Validate and, if allowed, commit the transaction that began at
    /// `transaction_position`.
    ///
    /// Rejections are reported in [`CommitOutcome::decision`], not as errors. A
    /// rejected transaction is aborted: its prepares are dropped from the index, a
    /// later commit of it fails with [`Error::InvalidTransaction`] and the scavenger
    /// removes them. So are prepares written before the store was last opened.
    ///
    /// # Errors
    ///
    /// Returns the validator's errors ([`Error::InvalidArgument`],
    /// [`Error::InvalidTransaction`], [`Error::PositionNotFound`]) and [`Error::Io`].
    pub fn write_commit(&mut self, transaction_position: u64) -> Result<CommitOutcome, Error> {
        self.commit_at(transaction_position)
    }

    /// Begin an explicit transaction on `stream_id`.
    ///
    /// # Returns
    ///
    /// The transaction position to pass to [`Store::write_transaction_data`] and
    /// [`Store::commit_transaction`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamDeleted`], [`Error::InvalidArgument`] or [`Error::Io`].
    pub fn start_transaction(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
    ) -> Result<u64, Error> {
        validate_stream_id(stream_id)?;
        if self.index.is_deleted(stream_id) {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            });
        }
        let position = self.write_prepare_record(
            stream_id,
            expected_version,
            None,
            -1,
            PrepareFlags::TRANSACTION_BEGIN,
            marker_event(),
        )?;
        self.flush_and_index()?;
        self.transactions.insert(
            position,
            OpenTransaction {
                stream_id: stream_id.to_string(),
                expected_version,
                next_offset: 0,
            },
        );
        tracing::debug!(stream_id, transaction_position = position, "started transaction");
        Ok(position)
    }

    /// Add events to an open explicit transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransaction`] if no transaction is open at
    /// `transaction_position` (including after a restart), plus input and I/O errors.
    pub fn write_transaction_data(
        &mut self,
        transaction_position: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<(), Error> {
        for event in &events {
            validate_event(event)?;
        }
        let transaction = self
            .transactions
            .get(&transaction_position)
            .cloned()
            .ok_or_else(|| unknown_transaction(transaction_position))?;

        let mut next_offset = transaction.next_offset;
        for event in events {
            let flags = PrepareFlags::DATA.with(PrepareFlags::IS_JSON, event.is_json);
            self.write_prepare_record(
                &transaction.stream_id,
                transaction.expected_version,
                Some(transaction_position),
                next_offset,
                flags,
                event,
            )?;
            next_offset += 1;
        }
        self.flush_and_index()?;
        if let Some(open) = self.transactions.get_mut(&transaction_position) {
            open.next_offset = next_offset;
        }
        Ok(())
    }

    /// Close and commit an explicit transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Store::append`], plus [`Error::InvalidTransaction`] for an unknown
    /// transaction.
    pub fn commit_transaction(&mut self, transaction_position: u64) -> Result<AppendResult, Error> {
        let transaction = self
            .transactions
            .remove(&transaction_position)
            .ok_or_else(|| unknown_transaction(transaction_position))?;
        self.write_prepare_record(
            &transaction.stream_id,
            transaction.expected_version,
            Some(transaction_position),
            -1,
            PrepareFlags::TRANSACTION_END,
            marker_event(),
        )?;
        let outcome = self.commit_at(transaction_position)?;
        outcome_to_result(outcome)
    }

    /// Delete a stream.
    ///
    /// A hard delete writes a `$streamDeleted` tombstone: the stream can never be
    /// written again and the scavenger removes everything but the tombstone. A soft
    /// delete sets `$tb` to one past the last event, hiding all current events while
    /// the stream stays writable.
    ///
    /// # Errors
    ///
    /// - [`Error::WrongExpectedVersion`], [`Error::StreamDeleted`].
    /// - [`Error::StreamNotFound`] for a soft delete of a stream without events.
    /// - [`Error::InvalidArgument`] for a metastream.
    pub fn delete_stream(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<DeleteResult, Error> {
        validate_stream_id(stream_id)?;
        if is_metastream(stream_id) {
            return Err(Error::InvalidArgument(format!(
                "metastream {stream_id} cannot be deleted"
            )));
        }

        if hard_delete {
            let tombstone = ProposedEvent {
                event_id: Uuid::new_v4(),
                event_type: STREAM_DELETED_EVENT_TYPE.to_string(),
                is_json: false,
                data: Bytes::new(),
                metadata: Bytes::new(),
            };
            let flags = PrepareFlags::DATA
                | PrepareFlags::STREAM_DELETE
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END;
            if self.index.is_deleted(stream_id) {
                return Err(Error::StreamDeleted {
                    stream_id: stream_id.to_string(),
                });
            }
            let tp =
                self.write_prepare_record(stream_id, expected_version, None, 0, flags, tombstone)?;
            let result = outcome_to_result(self.commit_at(tp)?)?;
            tracing::info!(stream_id, "hard-deleted stream");
            return Ok(DeleteResult {
                position: result.position.unwrap_or(tp),
            });
        }

        if self.index.is_deleted(stream_id) {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            });
        }
        let current = self.index.stream_version(stream_id);
        if !expected_version.matches(current) {
            return Err(Error::WrongExpectedVersion {
                stream_id: stream_id.to_string(),
                expected: expected_version,
                current,
            });
        }
        let last = current.ok_or_else(|| Error::StreamNotFound {
            stream_id: stream_id.to_string(),
        })?;
        let mut metadata = self.index.get_stream_metadata(stream_id)?.metadata;
        metadata.truncate_before = Some(last + 1);
        let result = self.set_stream_metadata(stream_id, ExpectedVersion::Any, &metadata)?;
        tracing::info!(stream_id, truncate_before = last + 1, "soft-deleted stream");
        Ok(DeleteResult {
            position: result.position.unwrap_or_default(),
        })
    }

    /// Replace the metadata of `stream_id` by appending a `$metadata` event to its
    /// metastream.
    ///
    /// # Arguments
    ///
    /// * `expected_version` - Checked against the metastream's version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a metastream id, [`Error::Metadata`] if
    /// serialization fails, and the errors of [`Store::append`].
    pub fn set_stream_metadata(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<AppendResult, Error> {
        validate_stream_id(stream_id)?;
        if is_metastream(stream_id) {
            return Err(Error::InvalidArgument(format!(
                "metastream {stream_id} has no metadata of its own"
            )));
        }
        let event = ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: METADATA_EVENT_TYPE.to_string(),
            is_json: true,
            data: metadata.to_json()?,
            metadata: Bytes::new(),
        };
        self.append(&metastream_of(stream_id), expected_version, vec![event])
    }

    /// Fsync chunk data and persist all checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a sync fails.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.flush_and_index()?;
        self.db.checkpoints().flush()
    }

    /// Flush everything and release the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final flush fails.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush()?;
        if !self.transactions.is_empty() {
            tracing::warn!(
                open_transactions = self.transactions.len(),
                "closing store with uncommitted explicit transactions"
            );
        }
        tracing::info!(writer = self.db.writer_position(), "closed store");
        Ok(())
    }

    /// Validate, commit if allowed, flush and index.
    fn commit_at(&mut self, transaction_position: u64) -> Result<CommitOutcome, Error> {
        let horizon = self.db.writer_position();
        let decision = match self
            .index
            .check_commit_starting_at(transaction_position, horizon)
        {
            Ok(decision) => decision,
            Err(e) => {
                self.flush_and_index()?;
                return Err(e);
            }
        };
        counter!("eventfold_commit_decisions_total", "decision" => decision.label()).increment(1);

        let commit_position = match &decision {
            CommitDecision::Ok {
                first_event_number,
                ..
            } => {
                let record = LogRecord::Commit(CommitLogRecord {
                    log_position: self.db.writer_position(),
                    transaction_position,
                    first_event_number: *first_event_number,
                    timestamp: now_millis(),
                    correlation_id: Uuid::new_v4(),
                });
                Some(self.write_record(record)?)
            }
            CommitDecision::Idempotent {
                commit_position, ..
            } => *commit_position,
            _ => None,
        };
        self.flush_and_index()?;
        if !matches!(decision, CommitDecision::Ok { .. }) {
            self.state
                .write()
                .expect("IndexState RwLock poisoned")
                .abort_transaction(transaction_position);
        }

        let events = match decision {
            CommitDecision::Ok { .. } => self.index.committed_events(transaction_position)?,
            _ => Vec::new(),
        };
        if !events.is_empty() {
            counter!("eventfold_appends_total").increment(1);
            counter!("eventfold_events_appended_total").increment(events.len() as u64);
            self.committed.extend(events.iter().cloned());
        }
        Ok(CommitOutcome {
            decision,
            commit_position,
            events,
        })
    }

    fn write_prepare_record(
        &mut self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        transaction_position: Option<u64>,
        transaction_offset: i32,
        flags: PrepareFlags,
        event: ProposedEvent,
    ) -> Result<u64, Error> {
        let position = self.db.writer_position();
        let record = LogRecord::Prepare(PrepareLogRecord {
            log_position: position,
            transaction_position: transaction_position.unwrap_or(position),
            transaction_offset,
            expected_version,
            stream_id: stream_id.to_string(),
            event_id: event.event_id,
            correlation_id: Uuid::new_v4(),
            event_type: event.event_type,
            timestamp: now_millis(),
            flags,
            data: event.data,
            metadata: event.metadata,
        });
        self.write_record(record)
    }

    /// Append one record; returns the position it actually landed at.
    fn write_record(&mut self, record: LogRecord) -> Result<u64, Error> {
        let position = self.db.append_record(&record)?;
        let stored = if position == record.log_position() {
            record
        } else {
            record.at_position(position)
        };
        self.unflushed.push(stored);
        Ok(position)
    }

    /// Make everything written so far durable, then apply it to the index.
    fn flush_and_index(&mut self) -> Result<(), Error> {
        self.db.flush()?;
        let writer = self.db.writer_position();
        {
            let mut state = self.state.write().expect("IndexState RwLock poisoned");
            for record in self.unflushed.drain(..) {
                state.index_record(&record);
            }
            state.set_indexed_position(writer);
        }
        let chaser = &self.db.checkpoints().chaser;
        chaser.write(writer as i64);
        chaser.flush()?;
        gauge!("eventfold_writer_position").set(writer as f64);
        Ok(())
    }

    fn write_epoch(&mut self, previous: Option<(u64, EpochRecord)>) -> Result<(), Error> {
        let epoch = EpochRecord {
            epoch_number: previous.as_ref().map_or(0, |(_, e)| e.epoch_number + 1),
            epoch_id: Uuid::new_v4(),
            previous_epoch_position: previous.as_ref().map(|(position, _)| *position),
        };
        let record = LogRecord::System(SystemLogRecord {
            log_position: self.db.writer_position(),
            timestamp: now_millis(),
            kind: SystemRecordKind::Epoch,
            data: epoch.to_bytes(),
        });
        let position = self.write_record(record)?;
        self.flush_and_index()?;
        self.state
            .write()
            .expect("IndexState RwLock poisoned")
            .set_epoch_position(position);

        let checkpoint = &self.db.checkpoints().epoch;
        checkpoint.write(position as i64);
        checkpoint.flush()?;
        tracing::info!(
            epoch = epoch.epoch_number,
            position,
            epoch_id = %epoch.epoch_id,
            "wrote epoch record"
        );
        self.epoch = epoch;
        Ok(())
    }
}

/// Read the epoch record the Epoch checkpoint points at, if any.
fn read_epoch(db: &ChunkDb) -> Result<Option<(u64, EpochRecord)>, Error> {
    let Ok(position) = u64::try_from(db.checkpoints().epoch.read()) else {
        return Ok(None);
    };
    match db.read_record(position) {
        Ok(Some(LogRecord::System(system))) if system.kind == SystemRecordKind::Epoch => {
            Ok(Some((position, EpochRecord::from_bytes(&system.data)?)))
        }
        Ok(_) | Err(Error::PositionNotFound { .. }) | Err(Error::OutOfRange { .. }) => {
            tracing::warn!(position, "epoch checkpoint does not point at an epoch record");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn outcome_to_result(outcome: CommitOutcome) -> Result<AppendResult, Error> {
    if let Some(err) = outcome.decision.to_error() {
        return Err(err);
    }
    let (event_range, idempotent) = match &outcome.decision {
        CommitDecision::Ok { event_range, .. } => (*event_range, false),
        CommitDecision::Idempotent { event_range, .. } => (*event_range, true),
        _ => (None, false),
    };
    Ok(AppendResult {
        position: outcome.commit_position,
        event_range,
        events: outcome.events,
        idempotent,
    })
}

fn unknown_transaction(transaction_position: u64) -> Error {
    Error::InvalidTransaction {
        transaction_position,
        detail: "no open transaction at this position".to_string(),
    }
}

/// Payload of begin/end markers of explicit transactions.
fn marker_event() -> ProposedEvent {
    ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type: String::new(),
        is_json: false,
        data: Bytes::new(),
        metadata: Bytes::new(),
    }
}

fn validate_stream_id(stream_id: &str) -> Result<(), Error> {
    if stream_id.is_empty() {
        return Err(Error::InvalidArgument(
            "stream id must not be empty".to_string(),
        ));
    }
    if stream_id.len() > MAX_STREAM_ID_LEN {
        return Err(Error::InvalidArgument(format!(
            "stream id exceeds {MAX_STREAM_ID_LEN} byte limit: {} bytes",
            stream_id.len()
        )));
    }
    Ok(())
}

fn validate_event(event: &ProposedEvent) -> Result<(), Error> {
    if event.event_type.is_empty() {
        return Err(Error::InvalidArgument(
            "event type must not be empty".to_string(),
        ));
    }
    if event.event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(Error::InvalidArgument(format!(
            "event type exceeds {} byte limit: {} bytes",
            MAX_EVENT_TYPE_LEN,
            event.event_type.len()
        )));
    }
    let size = event.data.len() + event.metadata.len();
    if size > MAX_EVENT_SIZE {
        return Err(Error::EventTooLarge {
            size,
            max: MAX_EVENT_SIZE,
        });
    }
    Ok(())
}
