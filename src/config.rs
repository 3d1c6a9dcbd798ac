//! Storage engine options.
//!
//! [`StorageConfig`] is what the library needs to open a database. The binary builds
//! one from `EVENTFOLD_*` environment variables (see `main.rs`); tests build one
//! directly with a small chunk size to exercise rollover.

use std::path::{Path, PathBuf};

/// Default logical chunk size: 256 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Default number of event ids remembered for idempotent `Any` appends.
pub const DEFAULT_DEDUP_CAPACITY: usize = 128;

/// Smallest accepted chunk size. A chunk must at least hold one small record.
pub const MIN_CHUNK_SIZE: u64 = 4 * 1024;

/// Options for [`crate::Store::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding chunk and checkpoint files.
    pub data_dir: PathBuf,
    /// Logical size of one chunk in bytes.
    pub chunk_size: u64,
    /// Capacity of the event-id dedup index.
    pub dedup_capacity: usize,
    /// Recompute the data CRC of every completed chunk on open.
    pub verify_hashes: bool,
    /// Let the scavenger merge consecutive small chunks.
    pub merge_chunks: bool,
}

impl StorageConfig {
    /// Options with defaults for everything but the data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> StorageConfig {
        StorageConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            verify_hashes: false,
            merge_chunks: false,
        }
    }

    /// Set the chunk size, raised to [`MIN_CHUNK_SIZE`] if smaller.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> StorageConfig {
        self.chunk_size = chunk_size.max(MIN_CHUNK_SIZE);
        self
    }

    /// Set the dedup capacity (at least 1).
    pub fn with_dedup_capacity(mut self, capacity: usize) -> StorageConfig {
        self.dedup_capacity = capacity.max(1);
        self
    }

    /// Enable or disable chunk hash verification on open.
    pub fn with_verify_hashes(mut self, verify: bool) -> StorageConfig {
        self.verify_hashes = verify;
        self
    }

    /// Enable or disable chunk merging during scavenge.
    pub fn with_merge_chunks(mut self, merge: bool) -> StorageConfig {
        self.merge_chunks = merge;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StorageConfig::new("/tmp/eventfold");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/eventfold"));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.dedup_capacity, DEFAULT_DEDUP_CAPACITY);
        assert!(!config.verify_hashes);
        assert!(!config.merge_chunks);
    }

    #[test]
    fn chunk_size_has_a_floor() {
        let config = StorageConfig::new("d").with_chunk_size(10);
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
        let config = StorageConfig::new("d").with_chunk_size(1 << 20);
        assert_eq!(config.chunk_size, 1 << 20);
    }

    #[test]
    fn dedup_capacity_has_a_floor() {
        assert_eq!(
            StorageConfig::new("d").with_dedup_capacity(0).dedup_capacity,
            1
        );
    }
}
