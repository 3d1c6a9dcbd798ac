//! Persisted log position counters.
//!
//! Three checkpoints track the state of the log:
//!
//! - **Writer**: position just past the last record appended. Recovered at open from
//!   the tail chunk's actual length, which is authoritative.
//! - **Chaser**: position up to which committed records have been applied to the
//!   read index. Never exceeds Writer.
//! - **Epoch**: position of the latest epoch record, or `-1` if none was written.
//!
//! Each checkpoint keeps a non-flushed value (visible to the Commit Validator, which
//! must see in-flight writes) and a flushed value (the durable one). A
//! [`FileCheckpoint`] stores its value as 8 little-endian bytes followed by a CRC32,
//! replacing the file atomically with temp-file + fsync + rename + directory fsync.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::chunk::sync_parent_dir;
use crate::error::Error;

/// File name of the Writer checkpoint.
pub const WRITER_CHECKPOINT_FILE: &str = "writer.chk";

/// File name of the Chaser checkpoint.
pub const CHASER_CHECKPOINT_FILE: &str = "chaser.chk";

/// File name of the Epoch checkpoint.
pub const EPOCH_CHECKPOINT_FILE: &str = "epoch.chk";

const CHECKPOINT_FILE_SIZE: usize = 12;

/// A single persisted `i64` counter.
pub trait Checkpoint: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// The durable value (last flushed).
    fn read(&self) -> i64;

    /// The latest written value, flushed or not.
    fn read_non_flushed(&self) -> i64;

    /// Set the non-flushed value.
    fn write(&self, value: i64);

    /// Persist the non-flushed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the value cannot be made durable.
    fn flush(&self) -> Result<(), Error>;
}

/// Checkpoint persisted in its own small file.
#[derive(Debug)]
pub struct FileCheckpoint {
    name: String,
    path: PathBuf,
    current: AtomicI64,
    flushed: AtomicI64,
    flush_lock: Mutex<()>,
}

impl FileCheckpoint {
    /// Open the checkpoint at `path`, or start at `initial` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] if the file exists but has the wrong size or
    /// a CRC mismatch, and [`Error::Io`] if it cannot be read.
    pub fn open(path: &Path, name: &str, initial: i64) -> Result<FileCheckpoint, Error> {
        let value = match std::fs::read(path) {
            Ok(bytes) => decode_checkpoint(&bytes).ok_or_else(|| {
                Error::InvalidHeader(format!("corrupt checkpoint file {}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => initial,
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(FileCheckpoint {
            name: name.to_string(),
            path: path.to_path_buf(),
            current: AtomicI64::new(value),
            flushed: AtomicI64::new(value),
            flush_lock: Mutex::new(()),
        })
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) {
        self.current.store(value, Ordering::Release);
    }

    fn flush(&self) -> Result<(), Error> {
        let _guard = self.flush_lock.lock().expect("checkpoint flush Mutex poisoned");
        let value = self.current.load(Ordering::Acquire);
        if value == self.flushed.load(Ordering::Acquire) && self.path.exists() {
            return Ok(());
        }

        let tmp_path = self.path.with_extension("chk.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&encode_checkpoint(value))?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;

        self.flushed.store(value, Ordering::Release);
        Ok(())
    }
}

/// Volatile checkpoint for tests and tools.
#[derive(Debug)]
pub struct InMemoryCheckpoint {
    name: String,
    current: AtomicI64,
    flushed: AtomicI64,
}

impl InMemoryCheckpoint {
    /// Create a checkpoint holding `initial`.
    pub fn new(name: &str, initial: i64) -> InMemoryCheckpoint {
        InMemoryCheckpoint {
            name: name.to_string(),
            current: AtomicI64::new(initial),
            flushed: AtomicI64::new(initial),
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) {
        self.current.store(value, Ordering::Release);
    }

    fn flush(&self) -> Result<(), Error> {
        self.flushed
            .store(self.current.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }
}

fn encode_checkpoint(value: i64) -> [u8; CHECKPOINT_FILE_SIZE] {
    let mut buf = [0u8; CHECKPOINT_FILE_SIZE];
    buf[..8].copy_from_slice(&value.to_le_bytes());
    let crc = crc32fast::hash(&buf[..8]);
    buf[8..].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_checkpoint(bytes: &[u8]) -> Option<i64> {
    if bytes.len() != CHECKPOINT_FILE_SIZE {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    let stored_crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    (crc32fast::hash(&raw) == stored_crc).then(|| i64::from_le_bytes(raw))
}

/// The Writer, Chaser and Epoch checkpoints of one database.
#[derive(Debug, Clone)]
pub struct Checkpoints {
    /// Position just past the last appended record.
    pub writer: Arc<dyn Checkpoint>,
    /// Position up to which the read index has applied the log.
    pub chaser: Arc<dyn Checkpoint>,
    /// Position of the latest epoch record, `-1` if none.
    pub epoch: Arc<dyn Checkpoint>,
}

impl Checkpoints {
    /// Open the three file checkpoints in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if any checkpoint file is corrupt or unreadable.
    pub fn open(dir: &Path) -> Result<Checkpoints, Error> {
        Ok(Checkpoints {
            writer: Arc::new(FileCheckpoint::open(
                &dir.join(WRITER_CHECKPOINT_FILE),
                "writer",
                0,
            )?),
            chaser: Arc::new(FileCheckpoint::open(
                &dir.join(CHASER_CHECKPOINT_FILE),
                "chaser",
                0,
            )?),
            epoch: Arc::new(FileCheckpoint::open(
                &dir.join(EPOCH_CHECKPOINT_FILE),
                "epoch",
                -1,
            )?),
        })
    }

    /// Volatile checkpoints starting from an empty log.
    pub fn in_memory() -> Checkpoints {
        Checkpoints {
            writer: Arc::new(InMemoryCheckpoint::new("writer", 0)),
            chaser: Arc::new(InMemoryCheckpoint::new("chaser", 0)),
            epoch: Arc::new(InMemoryCheckpoint::new("epoch", -1)),
        }
    }

    /// Current Writer position as a log position.
    pub fn writer_position(&self) -> u64 {
        self.writer.read_non_flushed().max(0) as u64
    }

    /// Reset Writer to the recovered tail position and clamp the others to it.
    ///
    /// Chaser is lowered to Writer if it is ahead. An Epoch checkpoint that does not
    /// point below Writer refers to a record that no longer exists and is reset to
    /// `-1`. All three are flushed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a checkpoint cannot be flushed.
    pub fn recover(&self, writer_position: u64) -> Result<(), Error> {
        let writer = writer_position as i64;
        let stored = self.writer.read();
        if stored != writer {
            tracing::info!(
                stored,
                recovered = writer,
                "writer checkpoint reset from tail chunk"
            );
        }
        self.writer.write(writer);

        let chaser = self.chaser.read_non_flushed();
        if chaser > writer {
            tracing::warn!(chaser, writer, "chaser checkpoint ahead of writer; clamping");
            self.chaser.write(writer);
        }
        let epoch = self.epoch.read_non_flushed();
        if epoch >= writer {
            tracing::warn!(epoch, writer, "epoch checkpoint beyond log end; resetting");
            self.epoch.write(-1);
        }

        self.flush()
    }

    /// Flush all three checkpoints.
    ///
    /// # Errors
    ///
    /// Returns the first flush error.
    pub fn flush(&self) -> Result<(), Error> {
        self.writer.flush()?;
        self.chaser.flush()?;
        self.epoch.flush()
    }
}
