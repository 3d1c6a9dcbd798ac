//! Binary codec for transaction log records.
//!
//! This module handles serialization and deserialization of the three log record
//! kinds: prepares, commits and system records. It is pure data transformation --
//! no file I/O, no locking, no index management.
//!
//! Every record is written as a self-delimiting frame:
//!
//! ```text
//! len: u32 LE | body (len - 4 bytes) | crc32(body): u32 LE | len: u32 LE
//! ```
//!
//! `len` counts the body plus the checksum. The trailing copy of `len` lets a reader
//! walk the log backwards. The body starts with a format version byte followed by a
//! record type byte; all integers are little-endian, strings are `u16`-length-prefixed
//! UTF-8 and byte blobs are `u32`-length-prefixed.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::Error;
use crate::types::{ExpectedVersion, MAX_EVENT_SIZE, PrepareFlags};

/// Current record body format version.
const RECORD_FORMAT_VERSION: u8 = 1;

const RECORD_TYPE_PREPARE: u8 = 0;
const RECORD_TYPE_COMMIT: u8 = 1;
const RECORD_TYPE_SYSTEM: u8 = 2;

/// Size of the leading length prefix in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the body checksum in bytes.
const CHECKSUM_SIZE: usize = 4;

/// Bytes a frame adds around its body: length prefix, checksum, length suffix.
pub const FRAME_OVERHEAD: usize = LENGTH_PREFIX_SIZE + CHECKSUM_SIZE + LENGTH_PREFIX_SIZE;

/// Largest value a frame's length field may hold. Anything larger is treated as
/// corruption rather than as a record waiting for more bytes.
const MAX_FRAME_LEN: usize = MAX_EVENT_SIZE + CHECKSUM_SIZE;

/// Result of attempting to decode a value from a byte buffer.
///
/// Distinguishes between a successfully decoded value and a buffer that does not
/// contain enough bytes to form a complete frame. A truncated trailing frame is
/// expected after an unclean shutdown, whereas a checksum mismatch indicates
/// corruption and is reported as [`Error::CorruptRecord`].
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A full value was successfully decoded from the buffer.
    Complete {
        /// The decoded value.
        value: T,
        /// Total number of bytes consumed from the buffer.
        consumed: usize,
    },
    /// The buffer does not contain enough bytes to form a complete frame.
    Incomplete,
}

/// A prepare: one event (or transaction marker) waiting for a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareLogRecord {
    /// Position of this record in the logical log.
    pub log_position: u64,
    /// Position of the first prepare of the transaction this prepare belongs to.
    pub transaction_position: u64,
    /// Zero-based index of this prepare among the transaction's data prepares.
    pub transaction_offset: i32,
    /// Concurrency expectation declared by the writer of the transaction.
    pub expected_version: ExpectedVersion,
    /// Target stream.
    pub stream_id: String,
    /// Client-assigned event id.
    pub event_id: Uuid,
    /// Correlation id shared by all records of one client request.
    pub correlation_id: Uuid,
    /// Event type tag (empty for transaction markers).
    pub event_type: String,
    /// Unix epoch milliseconds at write time.
    pub timestamp: u64,
    /// Record flags.
    pub flags: PrepareFlags,
    /// Event data.
    pub data: Bytes,
    /// Event metadata.
    pub metadata: Bytes,
}

impl PrepareLogRecord {
    /// `true` if this prepare carries an event that will receive an event number.
    pub fn is_data(&self) -> bool {
        self.flags.contains(PrepareFlags::DATA)
    }

    /// `true` if this prepare is the first of its transaction.
    pub fn begins_transaction(&self) -> bool {
        self.flags.contains(PrepareFlags::TRANSACTION_BEGIN)
    }

    /// `true` if this prepare closes its transaction.
    pub fn ends_transaction(&self) -> bool {
        self.flags.contains(PrepareFlags::TRANSACTION_END)
    }

    /// `true` if this prepare is a hard-delete tombstone.
    pub fn is_stream_delete(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_DELETE)
    }
}

/// A commit: assigns event numbers to the data prepares of one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitLogRecord {
    /// Position of this record in the logical log.
    pub log_position: u64,
    /// Position of the first prepare of the committed transaction.
    pub transaction_position: u64,
    /// Event number assigned to the data prepare with transaction offset 0.
    pub first_event_number: u64,
    /// Unix epoch milliseconds at write time.
    pub timestamp: u64,
    /// Correlation id of the request that produced the commit.
    pub correlation_id: Uuid,
}

/// Kind of a [`SystemLogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemRecordKind {
    /// Start of a new write epoch. Data is an encoded [`EpochRecord`].
    Epoch,
}

impl SystemRecordKind {
    fn to_byte(self) -> u8 {
        match self {
            SystemRecordKind::Epoch => 0,
        }
    }

    fn from_byte(b: u8) -> Option<SystemRecordKind> {
        match b {
            0 => Some(SystemRecordKind::Epoch),
            _ => None,
        }
    }
}

/// Engine-internal record that carries no events.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemLogRecord {
    /// Position of this record in the logical log.
    pub log_position: u64,
    /// Unix epoch milliseconds at write time.
    pub timestamp: u64,
    /// What the record describes.
    pub kind: SystemRecordKind,
    /// Kind-specific payload.
    pub data: Bytes,
}

/// Payload of an epoch system record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochRecord {
    /// Monotonic epoch counter, starting at 0.
    pub epoch_number: u64,
    /// Unique id of this epoch.
    pub epoch_id: Uuid,
    /// Log position of the previous epoch record, if any.
    pub previous_epoch_position: Option<u64>,
}

impl EpochRecord {
    const ENCODED_SIZE: usize = 8 + 16 + 8;

    /// Encode as the data of a system record.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::ENCODED_SIZE);
        buf.extend_from_slice(&self.epoch_number.to_le_bytes());
        buf.extend_from_slice(self.epoch_id.as_bytes());
        let prev = self.previous_epoch_position.map(|p| p as i64).unwrap_or(-1);
        buf.extend_from_slice(&prev.to_le_bytes());
        Bytes::from(buf)
    }

    /// Decode from the data of a system record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if `data` has the wrong size.
    pub fn from_bytes(data: &[u8]) -> Result<EpochRecord, Error> {
        let mut reader = BodyReader::new(data);
        let epoch_number = reader.u64()?;
        let epoch_id = reader.uuid()?;
        let prev = reader.i64()?;
        reader.finish()?;
        Ok(EpochRecord {
            epoch_number,
            epoch_id,
            previous_epoch_position: (prev >= 0).then_some(prev as u64),
        })
    }
}

/// A single record of the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// An event (or transaction marker) awaiting commit.
    Prepare(PrepareLogRecord),
    /// Assignment of event numbers to a transaction.
    Commit(CommitLogRecord),
    /// Engine-internal record.
    System(SystemLogRecord),
}

impl LogRecord {
    /// Position of the record in the logical log.
    pub fn log_position(&self) -> u64 {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
            LogRecord::System(s) => s.log_position,
        }
    }

    /// Returns a copy of the record placed at another log position.
    ///
    /// Used by the chunk manager when a record did not fit in the current chunk and
    /// must be re-encoded at the start of the next one. For a prepare that begins its
    /// own transaction the transaction position moves along with it.
    pub fn at_position(&self, position: u64) -> LogRecord {
        match self {
            LogRecord::Prepare(p) => {
                let mut p = p.clone();
                if p.transaction_position == p.log_position {
                    p.transaction_position = position;
                }
                p.log_position = position;
                LogRecord::Prepare(p)
            }
            LogRecord::Commit(c) => LogRecord::Commit(CommitLogRecord {
                log_position: position,
                ..c.clone()
            }),
            LogRecord::System(s) => LogRecord::System(SystemLogRecord {
                log_position: position,
                ..s.clone()
            }),
        }
    }
}

/// Sequential little-endian reader over a record body.
///
/// Every accessor returns [`Error::CorruptRecord`] when the body is shorter than the
/// field being read, so a malformed length can never cause a panic.
struct BodyReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.cursor + n > self.buf.len() {
            return Err(corrupt("unexpected end of record body"));
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.buf[start..self.cursor])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn uuid(&mut self) -> Result<Uuid, Error> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, Error> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|e| corrupt(format!("invalid UTF-8 in string field: {e}")))
    }

    fn blob(&mut self) -> Result<Bytes, Error> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn finish(&self) -> Result<(), Error> {
        if self.cursor != self.buf.len() {
            return Err(corrupt(format!(
                "{} trailing bytes after record body",
                self.buf.len() - self.cursor
            )));
        }
        Ok(())
    }
}

fn corrupt(detail: impl Into<String>) -> Error {
    Error::CorruptRecord {
        position: 0,
        detail: detail.into(),
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_blob(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
    buf.extend_from_slice(b);
}

fn encode_body(record: &LogRecord) -> Vec<u8> {
    let mut body = Vec::with_capacity(128);
    body.push(RECORD_FORMAT_VERSION);
    match record {
        LogRecord::Prepare(p) => {
            body.push(RECORD_TYPE_PREPARE);
            body.extend_from_slice(&p.flags.bits().to_le_bytes());
            body.extend_from_slice(&p.log_position.to_le_bytes());
            body.extend_from_slice(&p.transaction_position.to_le_bytes());
            body.extend_from_slice(&p.transaction_offset.to_le_bytes());
            body.extend_from_slice(&p.expected_version.to_raw().to_le_bytes());
            body.extend_from_slice(&p.timestamp.to_le_bytes());
            body.extend_from_slice(p.event_id.as_bytes());
            body.extend_from_slice(p.correlation_id.as_bytes());
            put_string(&mut body, &p.stream_id);
            put_string(&mut body, &p.event_type);
            put_blob(&mut body, &p.data);
            put_blob(&mut body, &p.metadata);
        }
        LogRecord::Commit(c) => {
            body.push(RECORD_TYPE_COMMIT);
            body.extend_from_slice(&c.log_position.to_le_bytes());
            body.extend_from_slice(&c.transaction_position.to_le_bytes());
            body.extend_from_slice(&c.first_event_number.to_le_bytes());
            body.extend_from_slice(&c.timestamp.to_le_bytes());
            body.extend_from_slice(c.correlation_id.as_bytes());
        }
        LogRecord::System(s) => {
            body.push(RECORD_TYPE_SYSTEM);
            body.push(s.kind.to_byte());
            body.extend_from_slice(&s.log_position.to_le_bytes());
            body.extend_from_slice(&s.timestamp.to_le_bytes());
            put_blob(&mut body, &s.data);
        }
    }
    body
}

/// Encode a [`LogRecord`] into its framed on-disk form.
///
/// The returned buffer contains the length prefix, the body, the CRC32 checksum of
/// the body and the length suffix. The caller can append it directly to a chunk.
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    let body = encode_body(record);
    let len = (body.len() + CHECKSUM_SIZE) as u32;

    let mut buf = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf
}

/// Read the frame length stored in the last four bytes of `buf`.
///
/// Used by backward scans: given the bytes that end exactly at a record boundary,
/// returns the total frame size of the record ending there, or `None` if `buf` is
/// too short or the length is implausible.
pub fn frame_size_before(buf: &[u8]) -> Option<usize> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    let tail = &buf[buf.len() - LENGTH_PREFIX_SIZE..];
    let len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as usize;
    if len < CHECKSUM_SIZE || len > MAX_FRAME_LEN {
        return None;
    }
    Some(len + 2 * LENGTH_PREFIX_SIZE)
}

/// Decode a single framed record from the start of a byte buffer.
///
/// Handles three cases:
///
/// 1. **Complete record** -- returns [`DecodeOutcome::Complete`] with the decoded
///    record and the total number of bytes consumed.
/// 2. **Incomplete data** -- the buffer ends before the frame does. Returns
///    [`DecodeOutcome::Incomplete`].
/// 3. **Corrupt data** -- implausible length, length prefix/suffix mismatch, checksum
///    mismatch, unknown version or type, or a malformed field. Returns
///    [`Error::CorruptRecord`] with `position` 0; callers that know the record's
///    position rewrite it.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] as described above.
pub fn decode_record(buf: &[u8]) -> Result<DecodeOutcome<LogRecord>, Error> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < CHECKSUM_SIZE + 2 || len > MAX_FRAME_LEN {
        return Err(corrupt(format!("implausible record length {len}")));
    }

    let total = len + 2 * LENGTH_PREFIX_SIZE;
    if buf.len() < total {
        return Ok(DecodeOutcome::Incomplete);
    }

    let suffix_start = total - LENGTH_PREFIX_SIZE;
    let suffix = u32::from_le_bytes([
        buf[suffix_start],
        buf[suffix_start + 1],
        buf[suffix_start + 2],
        buf[suffix_start + 3],
    ]) as usize;
    if suffix != len {
        return Err(corrupt(format!(
            "length prefix {len} does not match suffix {suffix}"
        )));
    }

    let crc_start = LENGTH_PREFIX_SIZE + len - CHECKSUM_SIZE;
    let body = &buf[LENGTH_PREFIX_SIZE..crc_start];
    let stored_crc = u32::from_le_bytes([
        buf[crc_start],
        buf[crc_start + 1],
        buf[crc_start + 2],
        buf[crc_start + 3],
    ]);
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(corrupt(format!(
            "CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
        )));
    }

    let record = decode_body(body)?;
    Ok(DecodeOutcome::Complete {
        value: record,
        consumed: total,
    })
}

fn decode_body(body: &[u8]) -> Result<LogRecord, Error> {
    let mut r = BodyReader::new(body);
    let version = r.u8()?;
    if version != RECORD_FORMAT_VERSION {
        return Err(corrupt(format!("unsupported record format version {version}")));
    }

    let record = match r.u8()? {
        RECORD_TYPE_PREPARE => {
            let raw_flags = r.u16()?;
            let flags = PrepareFlags::from_bits(raw_flags)
                .ok_or_else(|| corrupt(format!("unknown prepare flags {raw_flags:#06X}")))?;
            let log_position = r.u64()?;
            let transaction_position = r.u64()?;
            let transaction_offset = r.i32()?;
            let raw_expected = r.i64()?;
            let expected_version = ExpectedVersion::from_raw(raw_expected)
                .ok_or_else(|| corrupt(format!("invalid expected version {raw_expected}")))?;
            let timestamp = r.u64()?;
            let event_id = r.uuid()?;
            let correlation_id = r.uuid()?;
            let stream_id = r.string()?;
            let event_type = r.string()?;
            let data = r.blob()?;
            let metadata = r.blob()?;
            LogRecord::Prepare(PrepareLogRecord {
                log_position,
                transaction_position,
                transaction_offset,
                expected_version,
                stream_id,
                event_id,
                correlation_id,
                event_type,
                timestamp,
                flags,
                data,
                metadata,
            })
        }
        RECORD_TYPE_COMMIT => LogRecord::Commit(CommitLogRecord {
            log_position: r.u64()?,
            transaction_position: r.u64()?,
            first_event_number: r.u64()?,
            timestamp: r.u64()?,
            correlation_id: r.uuid()?,
        }),
        RECORD_TYPE_SYSTEM => {
            let raw_kind = r.u8()?;
            let kind = SystemRecordKind::from_byte(raw_kind)
                .ok_or_else(|| corrupt(format!("unknown system record kind {raw_kind}")))?;
            LogRecord::System(SystemLogRecord {
                log_position: r.u64()?,
                timestamp: r.u64()?,
                kind,
                data: r.blob()?,
            })
        }
        other => return Err(corrupt(format!("unknown record type {other}"))),
    };
    r.finish()?;
    Ok(record)
}
