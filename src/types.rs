//! Core domain types for the EventfoldDB storage engine.
//!
//! This module defines the foundational data types that every other module depends on:
//! proposed events (client-submitted), recorded events (committed, with positions),
//! expected version semantics for optimistic concurrency, prepare flags, stream
//! metadata, and the result shapes returned by reads and writes.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum size of a single encoded log record in bytes (fixed fields + stream id +
/// event type + data + metadata + framing).
///
/// Records larger than this are rejected before anything is written. A chunk must be
/// able to hold at least one record of this size.
pub const MAX_EVENT_SIZE: usize = 1024 * 1024; // 1 MB

/// Maximum length of an event type tag in bytes.
pub const MAX_EVENT_TYPE_LEN: usize = 256;

/// Maximum length of a stream id in bytes.
pub const MAX_STREAM_ID_LEN: usize = 1024;

/// Prefix that turns a stream id into its metastream id (`$$orders-1`).
pub const METASTREAM_PREFIX: &str = "$$";

/// Event type of the records written to a metastream.
pub const METADATA_EVENT_TYPE: &str = "$metadata";

/// Event type of the tombstone written by a hard delete.
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

/// Returns `true` if `stream_id` names a metastream (`$$<stream>`).
pub fn is_metastream(stream_id: &str) -> bool {
    stream_id.starts_with(METASTREAM_PREFIX)
}

/// Returns the metastream id that holds metadata for `stream_id`.
pub fn metastream_of(stream_id: &str) -> String {
    format!("{METASTREAM_PREFIX}{stream_id}")
}

/// Returns the stream a metastream describes, or `None` for an ordinary stream.
pub fn original_stream_of(metastream_id: &str) -> Option<&str> {
    metastream_id.strip_prefix(METASTREAM_PREFIX)
}

/// Current wall-clock time as Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An event the client wants to append to a stream.
///
/// The client assigns the `event_id` (a UUID serving as an idempotency key) and provides
/// the event type tag, metadata, and data as opaque byte buffers. The engine does not
/// interpret data or metadata contents.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Client-assigned unique ID for this event.
    pub event_id: Uuid,
    /// Event type tag (UTF-8, max 256 bytes).
    pub event_type: String,
    /// Whether `data` and `metadata` hold JSON. Stored as a flag, never checked.
    pub is_json: bool,
    /// Opaque domain event body.
    pub data: Bytes,
    /// Opaque infrastructure context (correlation ID, causation ID, etc.).
    pub metadata: Bytes,
}

/// A committed event with its assigned event number and log positions.
///
/// `log_position` is the position of the event's prepare record and never changes,
/// not even when the chunk holding it is rewritten by the scavenger.
/// `commit_position` is the position of the commit record that assigned
/// `event_number`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Client-assigned unique ID.
    pub event_id: Uuid,
    /// Zero-based event number within the stream.
    pub event_number: u64,
    /// Log position of the prepare record holding the event.
    pub log_position: u64,
    /// Log position of the commit record for the event's transaction.
    pub commit_position: u64,
    /// Unix epoch milliseconds, assigned when the prepare was written.
    pub recorded_at: u64,
    /// Event type tag.
    pub event_type: String,
    /// Whether the data is flagged as JSON.
    pub is_json: bool,
    /// Opaque data bytes.
    pub data: Bytes,
    /// Opaque metadata bytes.
    pub metadata: Bytes,
}

/// Controls optimistic concurrency on append.
///
/// On disk the variants are stored as a signed 64-bit value: `-2` for `Any`, `-1` for
/// `NoStream`, and the event number itself for `Exact`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    /// No concurrency check -- append succeeds regardless of stream state.
    Any,
    /// Stream must not exist (first write to a new stream).
    NoStream,
    /// Stream's last event number must be exactly this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Raw on-disk value for `Any`.
    pub const ANY_RAW: i64 = -2;
    /// Raw on-disk value for `NoStream`.
    pub const NO_STREAM_RAW: i64 = -1;

    /// Encode as the signed on-disk representation.
    pub fn to_raw(self) -> i64 {
        match self {
            ExpectedVersion::Any => Self::ANY_RAW,
            ExpectedVersion::NoStream => Self::NO_STREAM_RAW,
            ExpectedVersion::Exact(n) => n as i64,
        }
    }

    /// Decode the signed on-disk representation. Returns `None` for values below `-2`.
    pub fn from_raw(raw: i64) -> Option<ExpectedVersion> {
        match raw {
            Self::ANY_RAW => Some(ExpectedVersion::Any),
            Self::NO_STREAM_RAW => Some(ExpectedVersion::NoStream),
            n if n >= 0 => Some(ExpectedVersion::Exact(n as u64)),
            _ => None,
        }
    }

    /// Returns `true` if a stream whose last event number is `current` satisfies this
    /// expectation.
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current.is_none(),
            ExpectedVersion::Exact(n) => current == Some(n),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("Any"),
            ExpectedVersion::NoStream => f.write_str("NoStream"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

/// Bit set carried by every prepare record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    /// No flags set.
    pub const NONE: PrepareFlags = PrepareFlags(0);
    /// The prepare carries an event that receives an event number on commit.
    pub const DATA: PrepareFlags = PrepareFlags(0x0001);
    /// First prepare of a transaction.
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(0x0002);
    /// Last prepare of a transaction; the transaction may be committed.
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(0x0004);
    /// Tombstone written by a hard delete.
    pub const STREAM_DELETE: PrepareFlags = PrepareFlags(0x0008);
    /// Data and metadata are JSON.
    pub const IS_JSON: PrepareFlags = PrepareFlags(0x0100);

    const KNOWN: u16 = 0x0001 | 0x0002 | 0x0004 | 0x0008 | 0x0100;

    /// Raw bit representation.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Build from raw bits. Unknown bits are rejected.
    pub fn from_bits(bits: u16) -> Option<PrepareFlags> {
        if bits & !Self::KNOWN != 0 {
            return None;
        }
        Some(PrepareFlags(bits))
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets, usable in constants.
    pub const fn union(self, other: PrepareFlags) -> PrepareFlags {
        PrepareFlags(self.0 | other.0)
    }

    /// Returns a copy with the bits of `other` set when `on` is `true`.
    pub fn with(self, other: PrepareFlags, on: bool) -> PrepareFlags {
        if on { self | other } else { self }
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: PrepareFlags) -> PrepareFlags {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for PrepareFlags {
    fn bitor_assign(&mut self, rhs: PrepareFlags) {
        self.0 |= rhs.0;
    }
}

/// Access control lists stored in stream metadata.
///
/// Kept and round-tripped for the security collaborator; the storage engine never
/// enforces them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAcl {
    /// Roles allowed to read the stream.
    #[serde(rename = "$r", default, skip_serializing_if = "Vec::is_empty")]
    pub read_roles: Vec<String>,
    /// Roles allowed to write the stream.
    #[serde(rename = "$w", default, skip_serializing_if = "Vec::is_empty")]
    pub write_roles: Vec<String>,
    /// Roles allowed to delete the stream.
    #[serde(rename = "$d", default, skip_serializing_if = "Vec::is_empty")]
    pub delete_roles: Vec<String>,
    /// Roles allowed to read the metastream.
    #[serde(rename = "$mr", default, skip_serializing_if = "Vec::is_empty")]
    pub meta_read_roles: Vec<String>,
    /// Roles allowed to write the metastream.
    #[serde(rename = "$mw", default, skip_serializing_if = "Vec::is_empty")]
    pub meta_write_roles: Vec<String>,
}

/// Per-stream retention and access policy.
///
/// Written as JSON in `$metadata` events on the stream's metastream. The latest
/// committed metaevent is authoritative. Unknown keys are preserved in `custom`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Events older than this many seconds are hidden and scavengeable.
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
    /// Only the latest `max_count` events are visible and kept.
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
    /// Events with numbers below this value are hidden and scavengeable.
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<u64>,
    /// Cache hint for the transport collaborator, in seconds.
    #[serde(rename = "$cacheControl", default, skip_serializing_if = "Option::is_none")]
    pub cache_control_secs: Option<u64>,
    /// Access control lists.
    #[serde(rename = "$acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<StreamAcl>,
    /// User-defined metadata properties.
    #[serde(flatten)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl StreamMetadata {
    /// Metadata every metastream behaves as if it had: only the latest event counts.
    pub fn for_metastream() -> StreamMetadata {
        StreamMetadata {
            max_count: Some(1),
            ..StreamMetadata::default()
        }
    }

    /// `max_age_secs` as a [`Duration`].
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }

    /// Serialize to the JSON form stored in `$metadata` events.
    pub fn to_json(&self) -> Result<Bytes, crate::error::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse the JSON form stored in `$metadata` events.
    pub fn from_json(data: &[u8]) -> Result<StreamMetadata, crate::error::Error> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Lowest event number still visible for a stream whose last event is `last`,
    /// considering `$tb` and `$maxCount` (age is applied per event).
    pub fn first_visible(&self, last: u64) -> u64 {
        let by_count = self
            .max_count
            .map(|count| (last + 1).saturating_sub(count))
            .unwrap_or(0);
        by_count.max(self.truncate_before.unwrap_or(0))
    }

    /// Returns `true` if an event recorded at `recorded_at` (unix ms) has outlived
    /// `$maxAge` at `now` (unix ms).
    pub fn is_expired(&self, recorded_at: u64, now: u64) -> bool {
        match self.max_age_secs {
            Some(secs) => recorded_at.saturating_add(secs.saturating_mul(1000)) < now,
            None => false,
        }
    }
}

/// Result of a successful append or transaction commit.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendResult {
    /// Log position of the commit record (or of the original commit, for an
    /// idempotent retry). `None` when nothing had to be written.
    pub position: Option<u64>,
    /// First and last event numbers assigned. `None` for an empty write.
    pub event_range: Option<(u64, u64)>,
    /// The committed events. Empty for idempotent retries and empty writes.
    pub events: Vec<RecordedEvent>,
    /// `true` if the write duplicated an already committed one and nothing was written.
    pub idempotent: bool,
}

/// Result of a successful stream delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    /// Log position of the commit that performed the delete.
    pub position: u64,
}

/// A page of events read from a single stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSlice {
    /// Stream that was read.
    pub stream_id: String,
    /// Events in read direction order.
    pub events: Vec<RecordedEvent>,
    /// Event number to pass as `from` to continue reading in the same direction.
    pub next_event_number: u64,
    /// Last event number of the stream at read time.
    pub last_event_number: u64,
    /// `true` if there are no more events in the read direction.
    pub is_end_of_stream: bool,
}

/// A page of committed events read from the whole log (`$all`).
#[derive(Debug, Clone, PartialEq)]
pub struct AllSlice {
    /// Events in read direction order.
    pub events: Vec<RecordedEvent>,
    /// Log position to pass as `from` to continue reading in the same direction.
    pub next_position: u64,
    /// `true` if the read reached the end of the log in the read direction.
    pub is_end_of_stream: bool,
}

/// Current metadata of a stream together with the metastream version it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadataResult {
    /// Stream the metadata describes.
    pub stream_id: String,
    /// Event number of the metaevent, `None` if no metadata was ever written.
    pub metastream_version: Option<u64>,
    /// Effective metadata (default when none was written).
    pub metadata: StreamMetadata,
}

/// A message yielded by subscription streams (`subscribe_all`, `subscribe_stream`).
///
/// During the catch-up phase, the stream yields `Event` variants wrapping each historical
/// event in an `Arc` to avoid deep-cloning event data across subscribers. Once catch-up
/// completes, the stream yields a single `CaughtUp` marker, after which it transitions to
/// forwarding live events from the broadcast channel.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// A recorded event, shared via `Arc` to avoid deep-cloning across subscribers.
    Event(Arc<RecordedEvent>),
    /// Marks the end of the catch-up phase.
    CaughtUp,
}

/// Published by the writer for every event a commit made visible.
#[derive(Debug, Clone)]
pub struct EventCommitted {
    /// Log position of the commit record.
    pub position: u64,
    /// The committed event.
    pub event: Arc<RecordedEvent>,
    /// `true` if nothing was written after this commit when it was published.
    pub is_end_of_log: bool,
}

/// Lifecycle notifications of the writer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMessage {
    /// The writer accepts requests.
    Initialized {
        /// Writer position at start.
        writer_position: u64,
        /// Epoch written when the store was opened.
        epoch_number: u64,
    },
    /// The writer stopped and the store was closed.
    Shutdown,
}

/// Summary of a single stream returned by `ReadIndex::list_streams`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream id.
    pub stream_id: String,
    /// Last event number assigned in the stream.
    pub last_event_number: u64,
    /// `true` if the stream was hard-deleted.
    pub deleted: bool,
}
