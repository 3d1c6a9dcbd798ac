//! EventfoldDB storage engine: a chunked, append-only transaction log with a
//! prepare/commit protocol, optimistic concurrency, a derived read index, live
//! subscriptions and a background scavenger.

pub mod broker;
pub mod checkpoint;
pub mod chunk;
pub mod chunk_db;
pub mod codec;
pub mod commit;
pub mod config;
pub mod dedup;
pub mod error;
pub mod index;
pub mod metrics;
pub mod scavenger;
pub mod store;
pub mod types;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use broker::{Broker, subscribe_all, subscribe_stream};
pub use config::StorageConfig;
pub use error::Error;
pub use index::ReadIndex;
pub use scavenger::{ScavengeOptions, ScavengeResult, Scavenger};
pub use store::{CommitOutcome, Store};
pub use types::{
    AllSlice, AppendResult, DeleteResult, EventCommitted, ExpectedVersion, MAX_EVENT_SIZE,
    MAX_EVENT_TYPE_LEN, ProposedEvent, RecordedEvent, ServiceMessage, StreamMetadata,
    StreamMetadataResult, StreamSlice, SubscriptionMessage,
};
pub use writer::{WriterHandle, spawn_writer};

#[cfg(test)]
mod tests {
    // Every public entry point is reachable from the crate root.

    #[test]
    fn reexport_proposed_event() {
        let event = crate::ProposedEvent {
            event_id: uuid::Uuid::new_v4(),
            event_type: "TestEvent".to_string(),
            is_json: true,
            data: bytes::Bytes::from_static(b"{}"),
            metadata: bytes::Bytes::new(),
        };
        assert_eq!(event.event_type, "TestEvent");
    }

    #[test]
    fn reexport_expected_version() {
        assert_eq!(crate::ExpectedVersion::Any.to_raw(), -2);
        assert_eq!(crate::ExpectedVersion::NoStream.to_raw(), -1);
        assert_eq!(crate::ExpectedVersion::Exact(7).to_raw(), 7);
    }

    #[test]
    fn reexport_limits() {
        assert_eq!(crate::MAX_EVENT_SIZE, 1024 * 1024);
        assert_eq!(crate::MAX_EVENT_TYPE_LEN, 256);
    }

    #[test]
    fn reexport_config_and_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = crate::StorageConfig::new(dir.path());
        let store = crate::Store::open(&config).expect("open");
        let index: crate::ReadIndex = store.read_index();
        assert!(index.writer_position() > 0, "open writes an epoch record");
    }

    #[test]
    fn reexport_error() {
        let err = crate::Error::InvalidArgument("test".into());
        assert!(err.to_string().contains("test"));
    }
}
