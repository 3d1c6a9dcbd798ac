//! Raw log writer shared by unit tests that need exact control over records.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use uuid::Uuid;

use crate::checkpoint::Checkpoints;
use crate::chunk_db::ChunkDb;
use crate::codec::{CommitLogRecord, LogRecord, PrepareLogRecord};
use crate::config::{MIN_CHUNK_SIZE, StorageConfig};
use crate::index::{IndexState, ReadIndex};
use crate::types::{ExpectedVersion, PrepareFlags, now_millis};

/// Appends prepares and commits straight to a chunk database and applies them to a
/// read index after each flush, with no validation.
pub(crate) struct Harness {
    _dir: tempfile::TempDir,
    pub db: Arc<ChunkDb>,
    pub index: ReadIndex,
}

impl Harness {
    pub fn new() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig::new(dir.path()).with_chunk_size(MIN_CHUNK_SIZE * 4);
        let db = Arc::new(
            ChunkDb::open(dir.path(), &config, Checkpoints::in_memory()).expect("open"),
        );
        let state = IndexState::new(NonZeroUsize::new(16).expect("non-zero"));
        let index = ReadIndex::new(Arc::new(RwLock::new(state)), Arc::clone(&db));
        Harness {
            _dir: dir,
            db,
            index,
        }
    }

    /// Append, flush and index one record; returns its position.
    pub fn write(&self, record: LogRecord) -> u64 {
        let position = self.db.append_record(&record).expect("append");
        self.db.flush().expect("flush");
        let stored = self
            .db
            .read_record(position)
            .expect("read")
            .expect("present");
        let mut state = self.index.state.write().expect("lock");
        state.index_record(&stored);
        state.set_indexed_position(self.db.writer_position());
        position
    }

    /// A data prepare positioned at the Writer. `transaction_position = None` starts
    /// a new transaction at this prepare.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_record(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        transaction_position: Option<u64>,
        transaction_offset: i32,
        flags: PrepareFlags,
        event_id: Uuid,
        data: &[u8],
    ) -> LogRecord {
        let position = self.db.writer_position();
        LogRecord::Prepare(PrepareLogRecord {
            log_position: position,
            transaction_position: transaction_position.unwrap_or(position),
            transaction_offset,
            expected_version,
            stream_id: stream.to_string(),
            event_id,
            correlation_id: Uuid::new_v4(),
            event_type: "Happened".to_string(),
            timestamp: now_millis(),
            flags,
            data: Bytes::copy_from_slice(data),
            metadata: Bytes::new(),
        })
    }

    /// A self-contained single-event transaction; returns its position.
    pub fn single(&self, stream: &str, expected_version: ExpectedVersion, event_id: Uuid) -> u64 {
        let record = self.prepare_record(
            stream,
            expected_version,
            None,
            0,
            PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END,
            event_id,
            b"{}",
        );
        self.write(record)
    }

    /// Write a self-contained data prepare of `event_type` with `timestamp`.
    pub fn prepare(&self, stream: &str, event_type: &str, data: &[u8], timestamp: u64) -> u64 {
        let mut record = self.prepare_record(
            stream,
            ExpectedVersion::Any,
            None,
            0,
            PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END,
            Uuid::new_v4(),
            data,
        );
        if let LogRecord::Prepare(p) = &mut record {
            p.event_type = event_type.to_string();
            p.timestamp = timestamp;
        }
        self.write(record)
    }

    pub fn commit(&self, transaction_position: u64, first_event_number: u64) -> u64 {
        let position = self.db.writer_position();
        self.write(LogRecord::Commit(CommitLogRecord {
            log_position: position,
            transaction_position,
            first_event_number,
            timestamp: now_millis(),
            correlation_id: Uuid::new_v4(),
        }))
    }

    /// Write a self-contained event and commit it as `event_number`.
    pub fn event(&self, stream: &str, event_number: u64) -> u64 {
        let tp = self.prepare(stream, "Happened", b"{}", now_millis());
        self.commit(tp, event_number);
        tp
    }
}
