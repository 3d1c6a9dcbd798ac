//! Error types for the EventfoldDB storage engine.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Control-flow outcomes that are not failures
//! (an incomplete trailing record, a full chunk) are modelled as enum variants of the
//! relevant return types instead of errors: see [`crate::codec::DecodeOutcome`] and
//! [`crate::chunk::ChunkAppend`].
//!
//! Callers are expected to treat the variants in three groups:
//!
//! - **Routine**: `WrongExpectedVersion`, `StreamDeleted`, `StreamNotFound`,
//!   `EventNotFound`. Surfaced to the client as-is; retrying with corrected input is
//!   the normal response.
//! - **Precondition**: `PositionNotFound`, `OutOfRange`, `InvalidArgument`,
//!   `EventTooLarge`, `InvalidTransaction`.
//! - **Fatal / consistency**: `Io`, `CorruptRecord`, `InvalidHeader`,
//!   `CorruptedIdempotency`.

use crate::types::ExpectedVersion;

/// Unified error type for all storage engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Optimistic concurrency check failed: the stream's current version does not
    /// match the caller's expectation.
    #[error(
        "wrong expected version on stream {stream_id}: expected {expected}, current {}",
        display_version(.current)
    )]
    WrongExpectedVersion {
        /// Stream the append targeted.
        stream_id: String,
        /// The version the caller expected the stream to be at.
        expected: ExpectedVersion,
        /// The stream's actual last event number (`None` if the stream has no events).
        current: Option<u64>,
    },

    /// The requested stream does not exist.
    #[error("stream not found: {stream_id}")]
    StreamNotFound {
        /// Id of the stream that was not found.
        stream_id: String,
    },

    /// The stream has been hard-deleted; no further reads or writes are possible.
    #[error("stream deleted: {stream_id}")]
    StreamDeleted {
        /// Id of the deleted stream.
        stream_id: String,
    },

    /// The requested event number is beyond the stream's last event.
    #[error("event {event_number} not found in stream {stream_id}")]
    EventNotFound {
        /// Stream that was read.
        stream_id: String,
        /// Requested event number.
        event_number: u64,
    },

    /// A retried write carried different content from the write it duplicates.
    #[error("corrupted idempotency on stream {stream_id}: {detail}")]
    CorruptedIdempotency {
        /// Stream the retried write targeted.
        stream_id: String,
        /// Human-readable description of the mismatch.
        detail: String,
    },

    /// A transaction is unknown, not yet closed, or otherwise cannot be committed.
    #[error("invalid transaction at position {transaction_position}: {detail}")]
    InvalidTransaction {
        /// Log position of the transaction's first prepare.
        transaction_position: u64,
        /// Human-readable reason.
        detail: String,
    },

    /// A log position lies at or beyond the writer checkpoint.
    #[error("log position {position} not found")]
    PositionNotFound {
        /// The requested log position.
        position: u64,
    },

    /// A log position lies outside the readable region of a chunk.
    #[error("log position {position} out of range for chunk #{chunk_number}")]
    OutOfRange {
        /// The requested log position.
        position: u64,
        /// Start number of the chunk that was asked.
        chunk_number: u32,
    },

    /// An I/O error occurred during a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record on disk is corrupt (e.g., CRC mismatch, length mismatch).
    #[error("corrupt record at position {position}: {detail}")]
    CorruptRecord {
        /// Log position (or file offset, for headers) of the corrupt data.
        position: u64,
        /// Human-readable description of the corruption.
        detail: String,
    },

    /// A chunk or checkpoint header is invalid or unrecognized.
    #[error("invalid file header: {0}")]
    InvalidHeader(String),

    /// The encoded record exceeds the maximum allowed size.
    #[error("event too large: {size} bytes exceeds {max} byte limit")]
    EventTooLarge {
        /// Actual size of the record in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Stream metadata could not be serialized or parsed.
    #[error("invalid stream metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// A request argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn display_version(version: &Option<u64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "NoStream".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_expected_version_display() {
        let err = Error::WrongExpectedVersion {
            stream_id: "orders-1".into(),
            expected: ExpectedVersion::Exact(3),
            current: Some(2),
        };
        let msg = err.to_string();
        assert!(
            msg.contains("wrong expected version"),
            "expected 'wrong expected version' in: {msg}"
        );
        assert!(msg.contains("orders-1"), "expected stream id in: {msg}");
        assert!(msg.contains("3"), "expected '3' in: {msg}");
        assert!(msg.contains("2"), "expected '2' in: {msg}");
    }

    #[test]
    fn wrong_expected_version_display_without_stream() {
        let err = Error::WrongExpectedVersion {
            stream_id: "s".into(),
            expected: ExpectedVersion::Exact(0),
            current: None,
        };
        assert!(err.to_string().contains("NoStream"));
    }

    #[test]
    fn io_error_question_mark_coercion() {
        fn fallible() -> Result<(), Error> {
            let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
            Err(io_err)?
        }

        let result = fallible();
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn json_error_converts_to_metadata() {
        let json_err = serde_json::from_slice::<serde_json::Value>(b"{nope").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::Metadata(_)));
        assert!(err.to_string().contains("invalid stream metadata"));
    }

    #[test]
    fn corrupt_record_display() {
        let err = Error::CorruptRecord {
            position: 42,
            detail: "bad crc".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"), "expected '42' in: {msg}");
        assert!(msg.contains("bad crc"), "expected 'bad crc' in: {msg}");
    }

    #[test]
    fn out_of_range_display_names_chunk() {
        let err = Error::OutOfRange {
            position: 9000,
            chunk_number: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("9000"));
        assert!(msg.contains("#2"));
    }

    #[test]
    fn event_too_large_display() {
        let err = Error::EventTooLarge {
            size: 70000,
            max: 65536,
        };
        let msg = err.to_string();
        assert!(msg.contains("70000"), "expected '70000' in: {msg}");
        assert!(msg.contains("65536"), "expected '65536' in: {msg}");
    }
}
