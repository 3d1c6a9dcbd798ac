//! A single chunk file of the transaction log.
//!
//! The logical log is an unbounded byte range cut into fixed-size logical chunks of
//! `chunk_size` bytes. Chunk number `n` covers log positions
//! `[n * chunk_size, (n + 1) * chunk_size)`. A chunk file normally holds exactly one
//! logical chunk; a chunk produced by the scavenger may cover several consecutive
//! logical chunks (`start_number..=end_number`).
//!
//! On-disk layout:
//!
//! ```text
//! header (64 bytes) | record frames | position map (16 bytes/entry) | footer (64 bytes)
//! ```
//!
//! The position map and footer are only present once the chunk is completed. For a
//! chunk written by the log writer, a record's physical offset is its log position
//! minus the chunk's start position. A scavenged chunk stores records at their
//! original log positions but packed contiguously, so it carries a position map from
//! log position to physical offset.
//!
//! File names are `chunk-<start:06>.<generation:06>`; the generation increments each
//! time the scavenger replaces the chunk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::codec::{self, DecodeOutcome, LogRecord};
use crate::error::Error;

/// Size of the chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 64;

/// Size of the chunk footer in bytes.
pub const CHUNK_FOOTER_SIZE: usize = 64;

/// Size of one position map entry (log position u64 + physical offset u64).
const POSMAP_ENTRY_SIZE: usize = 16;

/// Magic bytes identifying a chunk header (ASCII "EFCH").
const HEADER_MAGIC: [u8; 4] = [0x45, 0x46, 0x43, 0x48];

/// Magic bytes identifying a chunk footer (ASCII "EFCF").
const FOOTER_MAGIC: [u8; 4] = [0x45, 0x46, 0x43, 0x46];

/// Current chunk file format version.
const CHUNK_FORMAT_VERSION: u32 = 1;

const FOOTER_FLAG_HAS_POSMAP: u32 = 0x1;

/// Suffix of chunk files that are still being written by the scavenger.
pub const SCAVENGE_TMP_SUFFIX: &str = ".scavenge.tmp";

/// File name of the chunk starting at logical chunk `start_number` with `generation`.
pub fn chunk_file_name(start_number: u32, generation: u32) -> String {
    format!("chunk-{start_number:06}.{generation:06}")
}

/// Parse a chunk file name into `(start_number, generation)`.
///
/// Returns `None` for anything that is not a final chunk file name (including
/// scavenge temp files).
pub fn parse_chunk_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("chunk-")?;
    let (start, generation) = rest.split_once('.')?;
    if start.len() != 6 || generation.len() != 6 {
        return None;
    }
    Some((start.parse().ok()?, generation.parse().ok()?))
}

/// Fixed metadata written at the start of every chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Logical size of one chunk in bytes.
    pub chunk_size: u64,
    /// First logical chunk number covered by this file.
    pub start_number: u32,
    /// Last logical chunk number covered by this file (inclusive).
    pub end_number: u32,
    /// Scavenge generation; 0 for chunks written by the log writer.
    pub generation: u32,
}

impl ChunkHeader {
    /// First log position covered by the chunk.
    pub fn start_position(&self) -> u64 {
        self.start_number as u64 * self.chunk_size
    }

    /// Log position just past the chunk's logical range.
    pub fn end_position(&self) -> u64 {
        (self.end_number as u64 + 1) * self.chunk_size
    }

    /// Physical bytes of record data the chunk may hold.
    pub fn capacity(&self) -> u64 {
        self.end_position() - self.start_position()
    }

    /// Encode as a fixed 64-byte array with a trailing CRC32.
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&HEADER_MAGIC);
        buf[4..8].copy_from_slice(&CHUNK_FORMAT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.start_number.to_le_bytes());
        buf[20..24].copy_from_slice(&self.end_number.to_le_bytes());
        buf[24..28].copy_from_slice(&self.generation.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CHUNK_HEADER_SIZE - 4]);
        buf[CHUNK_HEADER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and validate a chunk header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] on wrong magic, unsupported version, CRC
    /// mismatch, or an inconsistent chunk range.
    pub fn decode(buf: &[u8; CHUNK_HEADER_SIZE]) -> Result<ChunkHeader, Error> {
        if buf[0..4] != HEADER_MAGIC {
            return Err(Error::InvalidHeader(
                "wrong chunk magic bytes: expected EFCH".to_string(),
            ));
        }
        let stored_crc = read_u32(buf, CHUNK_HEADER_SIZE - 4);
        let computed_crc = crc32fast::hash(&buf[..CHUNK_HEADER_SIZE - 4]);
        if stored_crc != computed_crc {
            return Err(Error::InvalidHeader(format!(
                "chunk header CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
            )));
        }
        let version = read_u32(buf, 4);
        if version != CHUNK_FORMAT_VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported chunk format version: {version}"
            )));
        }
        let header = ChunkHeader {
            chunk_size: read_u64(buf, 8),
            start_number: read_u32(buf, 16),
            end_number: read_u32(buf, 20),
            generation: read_u32(buf, 24),
        };
        if header.chunk_size == 0 || header.end_number < header.start_number {
            return Err(Error::InvalidHeader(format!(
                "inconsistent chunk range {}..={} with chunk size {}",
                header.start_number, header.end_number, header.chunk_size
            )));
        }
        Ok(header)
    }
}

/// Metadata written at the end of a completed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    /// `true` if a position map precedes the footer.
    pub has_posmap: bool,
    /// Bytes of record data physically stored.
    pub physical_data_size: u64,
    /// Logical bytes covered, measured from the chunk's start position.
    pub logical_data_size: u64,
    /// Number of position map entries.
    pub map_count: u32,
    /// CRC32 over record data followed by the position map.
    pub data_crc: u32,
}

impl ChunkFooter {
    fn encode(&self) -> [u8; CHUNK_FOOTER_SIZE] {
        let mut buf = [0u8; CHUNK_FOOTER_SIZE];
        buf[0..4].copy_from_slice(&FOOTER_MAGIC);
        let flags = if self.has_posmap {
            FOOTER_FLAG_HAS_POSMAP
        } else {
            0
        };
        buf[4..8].copy_from_slice(&flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.physical_data_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.logical_data_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.map_count.to_le_bytes());
        buf[28..32].copy_from_slice(&self.data_crc.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CHUNK_FOOTER_SIZE - 4]);
        buf[CHUNK_FOOTER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Returns `None` when `buf` is not a valid footer (the chunk is then an
    /// incomplete tail).
    fn decode(buf: &[u8; CHUNK_FOOTER_SIZE]) -> Option<ChunkFooter> {
        if buf[0..4] != FOOTER_MAGIC {
            return None;
        }
        let stored_crc = read_u32(buf, CHUNK_FOOTER_SIZE - 4);
        if stored_crc != crc32fast::hash(&buf[..CHUNK_FOOTER_SIZE - 4]) {
            return None;
        }
        Some(ChunkFooter {
            has_posmap: read_u32(buf, 4) & FOOTER_FLAG_HAS_POSMAP != 0,
            physical_data_size: read_u64(buf, 8),
            logical_data_size: read_u64(buf, 16),
            map_count: read_u32(buf, 24),
            data_crc: read_u32(buf, 28),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Mapping of one surviving record in a scavenged chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PosMapEntry {
    log_position: u64,
    physical_offset: u64,
}

/// Outcome of [`Chunk::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAppend {
    /// The record was written (not yet flushed).
    Written {
        /// Log position assigned to the record.
        log_position: u64,
        /// Log position just past the record.
        next_position: u64,
    },
    /// The record does not fit; the caller must complete this chunk and roll over.
    Full,
}

/// Mutable state of a chunk that is still being written.
struct WriteState {
    file: File,
    /// Record bytes written so far.
    physical_len: u64,
    /// Running CRC32 over the record bytes.
    hasher: crc32fast::Hasher,
    /// Position map being built, for scavenge targets only.
    posmap: Option<Vec<PosMapEntry>>,
    /// Logical size the completed chunk will report, for scavenge targets only.
    logical_size: Option<u64>,
}

/// One chunk file of the log.
///
/// Chunks are shared as `Arc<Chunk>`. A reader that obtained a handle keeps reading
/// consistent data even after the scavenger replaced the chunk: the replaced file is
/// only unlinked when the last handle is dropped (see [`Chunk::mark_for_deletion`]).
pub struct Chunk {
    header: ChunkHeader,
    path: Mutex<PathBuf>,
    /// Read-only handle used by all readers.
    reader: Mutex<File>,
    /// Present until the chunk is completed.
    writer: Mutex<Option<WriteState>>,
    /// Record bytes visible to readers in this process.
    written_len: AtomicU64,
    /// Record bytes known to be durable.
    flushed_len: AtomicU64,
    footer: OnceLock<ChunkFooter>,
    posmap: OnceLock<Vec<PosMapEntry>>,
    delete_on_drop: AtomicBool,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("header", &self.header)
            .field("written_len", &self.written_len.load(Ordering::Acquire))
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Chunk {
    /// Create a new, empty, writable chunk file for logical chunk `number`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file already exists or cannot be written.
    pub fn create_new(dir: &Path, number: u32, chunk_size: u64) -> Result<Arc<Chunk>, Error> {
        let header = ChunkHeader {
            chunk_size,
            start_number: number,
            end_number: number,
            generation: 0,
        };
        let path = dir.join(chunk_file_name(number, 0));
        Self::create(path, header, None, None)
    }

    /// Create a temp chunk the scavenger fills with surviving records.
    ///
    /// The chunk covers `start_number..=end_number` at `generation` and reports
    /// `logical_size` once completed. It becomes visible only through
    /// [`crate::chunk_db::ChunkDb::replace_chunks`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the temp file cannot be created.
    pub fn create_scavenge_target(
        dir: &Path,
        header: ChunkHeader,
        logical_size: u64,
    ) -> Result<Arc<Chunk>, Error> {
        let name = format!(
            "{}{SCAVENGE_TMP_SUFFIX}",
            chunk_file_name(header.start_number, header.generation)
        );
        Self::create(dir.join(name), header, Some(Vec::new()), Some(logical_size))
    }

    fn create(
        path: PathBuf,
        header: ChunkHeader,
        posmap: Option<Vec<PosMapEntry>>,
        logical_size: Option<u64>,
    ) -> Result<Arc<Chunk>, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&header.encode())?;
        file.sync_all()?;
        sync_parent_dir(&path)?;

        let reader = File::open(&path)?;
        tracing::debug!(
            path = %path.display(),
            start = header.start_number,
            end = header.end_number,
            generation = header.generation,
            "created chunk"
        );
        Ok(Arc::new(Chunk {
            header,
            path: Mutex::new(path),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(WriteState {
                file,
                physical_len: 0,
                hasher: crc32fast::Hasher::new(),
                posmap,
                logical_size,
            })),
            written_len: AtomicU64::new(0),
            flushed_len: AtomicU64::new(0),
            footer: OnceLock::new(),
            posmap: OnceLock::new(),
            delete_on_drop: AtomicBool::new(false),
        }))
    }

    /// Open an existing chunk file.
    ///
    /// A chunk with a valid footer opens read-only. Otherwise it is the log's tail:
    /// records are scanned from the start and a trailing incomplete or corrupt frame
    /// (the last write before a crash) is truncated with a `tracing::warn!`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] for a bad header, [`Error::CorruptRecord`] if a
    /// corrupt record is followed by valid records, and [`Error::Io`] on I/O failure.
    pub fn open(path: &Path) -> Result<Arc<Chunk>, Error> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < CHUNK_HEADER_SIZE as u64 {
            return Err(Error::InvalidHeader(format!(
                "chunk file {} too short for header: {file_len} bytes",
                path.display()
            )));
        }

        let mut header_buf = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = ChunkHeader::decode(&header_buf)?;

        if let Some(footer) = read_footer(&mut file, file_len)? {
            let expected_len = CHUNK_HEADER_SIZE as u64
                + footer.physical_data_size
                + footer.map_count as u64 * POSMAP_ENTRY_SIZE as u64
                + CHUNK_FOOTER_SIZE as u64;
            if expected_len != file_len {
                return Err(Error::InvalidHeader(format!(
                    "completed chunk {} has length {file_len}, footer implies {expected_len}",
                    path.display()
                )));
            }
            let chunk = Chunk {
                header,
                path: Mutex::new(path.to_path_buf()),
                reader: Mutex::new(file),
                writer: Mutex::new(None),
                written_len: AtomicU64::new(footer.physical_data_size),
                flushed_len: AtomicU64::new(footer.physical_data_size),
                footer: OnceLock::new(),
                posmap: OnceLock::new(),
                delete_on_drop: AtomicBool::new(false),
            };
            if footer.has_posmap {
                let posmap = chunk.load_posmap(&footer)?;
                let _ = chunk.posmap.set(posmap);
            }
            let _ = chunk.footer.set(footer);
            return Ok(Arc::new(chunk));
        }

        // Incomplete tail chunk: find the end of the last valid record.
        let data_len = file_len - CHUNK_HEADER_SIZE as u64;
        let mut hasher = crc32fast::Hasher::new();
        let mut offset = 0u64;
        {
            let mut window = DataWindow::new(&mut file, data_len)?;
            loop {
                match codec::decode_record(window.bytes_from(offset)) {
                    Ok(DecodeOutcome::Complete { consumed, .. }) => {
                        hasher.update(&window.bytes_from(offset)[..consumed]);
                        offset += consumed as u64;
                    }
                    Ok(DecodeOutcome::Incomplete) => {
                        if !window.advance(offset)? {
                            break;
                        }
                    }
                    Err(Error::CorruptRecord { detail, .. }) => {
                        if window.has_valid_record_after(offset)? {
                            return Err(Error::CorruptRecord {
                                position: header.start_position() + offset,
                                detail: format!("mid-chunk corruption: {detail}"),
                            });
                        }
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if offset < data_len {
            tracing::warn!(
                path = %path.display(),
                valid_bytes = offset,
                discarded_bytes = data_len - offset,
                "truncating incomplete trailing record in tail chunk"
            );
            file.set_len(CHUNK_HEADER_SIZE as u64 + offset)?;
            file.sync_all()?;
        }

        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64 + offset))?;
        let reader = File::open(path)?;

        Ok(Arc::new(Chunk {
            header,
            path: Mutex::new(path.to_path_buf()),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(WriteState {
                file,
                physical_len: offset,
                hasher,
                posmap: None,
                logical_size: None,
            })),
            written_len: AtomicU64::new(offset),
            flushed_len: AtomicU64::new(offset),
            footer: OnceLock::new(),
            posmap: OnceLock::new(),
            delete_on_drop: AtomicBool::new(false),
        }))
    }

    /// The chunk's header.
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Current path of the chunk file.
    pub fn path(&self) -> PathBuf {
        self.path.lock().expect("chunk path Mutex poisoned").clone()
    }

    /// `true` once [`Chunk::complete`] succeeded (or the chunk was opened completed).
    pub fn is_completed(&self) -> bool {
        self.footer.get().is_some()
    }

    /// The footer of a completed chunk.
    pub fn footer(&self) -> Option<&ChunkFooter> {
        self.footer.get()
    }

    /// `true` if records are addressed through a position map (scavenged chunk).
    pub fn is_scavenged(&self) -> bool {
        self.posmap.get().is_some()
    }

    /// Record bytes stored in the chunk and visible to readers.
    pub fn physical_data_size(&self) -> u64 {
        self.written_len.load(Ordering::Acquire)
    }

    /// Record bytes known to be on stable storage.
    pub fn flushed_data_size(&self) -> u64 {
        self.flushed_len.load(Ordering::Acquire)
    }

    /// Log position just past the last record the chunk holds.
    pub fn data_end_position(&self) -> u64 {
        let logical = match self.footer.get() {
            Some(footer) => footer.logical_data_size,
            None => self.written_len.load(Ordering::Acquire),
        };
        self.header.start_position() + logical
    }

    /// Append an encoded record at the end of a writer-owned chunk.
    ///
    /// The bytes are written but not fsynced; call [`Chunk::flush`] before
    /// acknowledging the write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the chunk is completed or is a scavenge
    /// target, and [`Error::Io`] if the write fails.
    pub fn append(&self, record: &[u8]) -> Result<ChunkAppend, Error> {
        let mut guard = self.writer.lock().expect("chunk writer Mutex poisoned");
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("append to a completed chunk".into()))?;
        if state.posmap.is_some() {
            return Err(Error::InvalidArgument(
                "append to a scavenge target; use append_at".into(),
            ));
        }
        if state.physical_len + record.len() as u64 > self.header.capacity() {
            return Ok(ChunkAppend::Full);
        }

        let log_position = self.header.start_position() + state.physical_len;
        state.file.write_all(record)?;
        state.hasher.update(record);
        state.physical_len += record.len() as u64;
        self.written_len
            .store(state.physical_len, Ordering::Release);

        Ok(ChunkAppend::Written {
            log_position,
            next_position: log_position + record.len() as u64,
        })
    }

    /// Append an already encoded record that keeps its original `log_position`.
    ///
    /// Only valid on a scavenge target. Positions must be strictly increasing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a non-target chunk, a position outside the
    /// chunk's range, a non-increasing position, or when the data does not fit;
    /// [`Error::Io`] if the write fails.
    pub fn append_at(&self, log_position: u64, record: &[u8]) -> Result<(), Error> {
        let mut guard = self.writer.lock().expect("chunk writer Mutex poisoned");
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("append to a completed chunk".into()))?;
        let posmap = state.posmap.as_mut().ok_or_else(|| {
            Error::InvalidArgument("append_at on a writer chunk; use append".into())
        })?;

        if log_position < self.header.start_position()
            || log_position >= self.header.end_position()
        {
            return Err(Error::InvalidArgument(format!(
                "log position {log_position} outside chunk range {}..{}",
                self.header.start_position(),
                self.header.end_position()
            )));
        }
        if posmap
            .last()
            .is_some_and(|last| last.log_position >= log_position)
        {
            return Err(Error::InvalidArgument(format!(
                "log position {log_position} is not after the previous record"
            )));
        }
        if state.physical_len + record.len() as u64 > self.header.capacity() {
            return Err(Error::InvalidArgument(
                "scavenged records do not fit in the target chunk".into(),
            ));
        }

        posmap.push(PosMapEntry {
            log_position,
            physical_offset: state.physical_len,
        });
        state.file.write_all(record)?;
        state.hasher.update(record);
        state.physical_len += record.len() as u64;
        self.written_len
            .store(state.physical_len, Ordering::Release);
        Ok(())
    }

    /// Fsync written record bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the sync fails.
    pub fn flush(&self) -> Result<(), Error> {
        let guard = self.writer.lock().expect("chunk writer Mutex poisoned");
        if let Some(state) = guard.as_ref() {
            state.file.sync_data()?;
            self.flushed_len
                .store(state.physical_len, Ordering::Release);
        }
        Ok(())
    }

    /// Mark the chunk read-only: write the position map (if any) and the footer, then
    /// fsync. Irreversible; completing an already completed chunk is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing or syncing fails.
    pub fn complete(&self) -> Result<(), Error> {
        let mut guard = self.writer.lock().expect("chunk writer Mutex poisoned");
        let Some(mut state) = guard.take() else {
            return Ok(());
        };

        let mut map_bytes = Vec::new();
        let map_count = state.posmap.as_ref().map(Vec::len).unwrap_or(0);
        if let Some(posmap) = &state.posmap {
            map_bytes.reserve(posmap.len() * POSMAP_ENTRY_SIZE);
            for entry in posmap {
                map_bytes.extend_from_slice(&entry.log_position.to_le_bytes());
                map_bytes.extend_from_slice(&entry.physical_offset.to_le_bytes());
            }
        }
        state.hasher.update(&map_bytes);

        let footer = ChunkFooter {
            has_posmap: state.posmap.is_some(),
            physical_data_size: state.physical_len,
            logical_data_size: state.logical_size.unwrap_or(state.physical_len),
            map_count: map_count as u32,
            data_crc: state.hasher.clone().finalize(),
        };

        let result = (|| -> Result<(), Error> {
            state.file.write_all(&map_bytes)?;
            state.file.write_all(&footer.encode())?;
            state.file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            *guard = Some(state);
            return Err(e);
        }

        if let Some(posmap) = state.posmap.take() {
            let _ = self.posmap.set(posmap);
        }
        let _ = self.footer.set(footer);
        self.flushed_len
            .store(state.physical_len, Ordering::Release);
        tracing::debug!(
            path = %self.path().display(),
            physical = footer.physical_data_size,
            logical = footer.logical_data_size,
            "completed chunk"
        );
        Ok(())
    }

    /// Recompute the data CRC of a completed chunk and compare it with the footer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] on mismatch, [`Error::InvalidArgument`] for an
    /// incomplete chunk, [`Error::Io`] on read failure.
    pub fn verify(&self) -> Result<(), Error> {
        let footer = self
            .footer
            .get()
            .ok_or_else(|| Error::InvalidArgument("cannot verify an incomplete chunk".into()))?;
        let len = footer.physical_data_size as usize + footer.map_count as usize * POSMAP_ENTRY_SIZE;
        let bytes = self.read_physical(0, len)?;
        let computed = crc32fast::hash(&bytes);
        if computed != footer.data_crc {
            return Err(Error::CorruptRecord {
                position: self.header.start_position(),
                detail: format!(
                    "chunk {} data CRC32 mismatch: stored {:#010X}, computed {computed:#010X}",
                    self.path().display(),
                    footer.data_crc
                ),
            });
        }
        Ok(())
    }

    /// Read the record stored at `log_position`.
    ///
    /// Returns `Ok(None)` if the chunk is scavenged and the record at that position
    /// was removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the position lies outside the chunk or beyond
    /// its written data, [`Error::CorruptRecord`] if the record cannot be decoded.
    pub fn read_at(&self, log_position: u64) -> Result<Option<LogRecord>, Error> {
        if log_position < self.header.start_position()
            || log_position >= self.data_end_position()
        {
            return Err(self.out_of_range(log_position));
        }
        let physical = match self.posmap.get() {
            Some(posmap) => match posmap.binary_search_by_key(&log_position, |e| e.log_position) {
                Ok(idx) => posmap[idx].physical_offset,
                Err(_) => return Ok(None),
            },
            None => log_position - self.header.start_position(),
        };
        match self.read_frame(physical)? {
            Some((record, _)) => {
                self.check_position(&record, log_position)?;
                Ok(Some(record))
            }
            None => Err(self.out_of_range(log_position)),
        }
    }

    /// Read the first record at or after `from`.
    ///
    /// Returns the record and the log position just past it, or `None` at the end of
    /// the chunk's data. A truncated trailing frame also ends the scan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if a record cannot be decoded.
    pub fn read_next(&self, from: u64) -> Result<Option<(LogRecord, u64)>, Error> {
        let start = self.header.start_position();
        let from = from.max(start);
        let (physical, expected) = match self.posmap.get() {
            Some(posmap) => {
                let idx = posmap.partition_point(|e| e.log_position < from);
                match posmap.get(idx) {
                    Some(entry) => (entry.physical_offset, entry.log_position),
                    None => return Ok(None),
                }
            }
            None => {
                if from >= self.data_end_position() {
                    return Ok(None);
                }
                (from - start, from)
            }
        };
        match self.read_frame(physical)? {
            Some((record, size)) => {
                self.check_position(&record, expected)?;
                Ok(Some((record, expected + size as u64)))
            }
            None => Ok(None),
        }
    }

    /// Read the last record that starts before `before`.
    ///
    /// `before` must be a record boundary (a position returned by a previous read) or
    /// lie at or beyond the end of the chunk's data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if a record cannot be decoded or the length
    /// suffix is implausible.
    pub fn read_prev(&self, before: u64) -> Result<Option<LogRecord>, Error> {
        let start = self.header.start_position();
        if before <= start {
            return Ok(None);
        }
        let (physical, expected) = match self.posmap.get() {
            Some(posmap) => {
                let idx = posmap.partition_point(|e| e.log_position < before);
                if idx == 0 {
                    return Ok(None);
                }
                let entry = posmap[idx - 1];
                (entry.physical_offset, entry.log_position)
            }
            None => {
                let end = (before - start).min(self.written_len.load(Ordering::Acquire));
                if end == 0 {
                    return Ok(None);
                }
                let suffix_at = end.saturating_sub(4);
                let suffix = self.read_physical(suffix_at, 4)?;
                let size = codec::frame_size_before(&suffix).ok_or_else(|| {
                    Error::CorruptRecord {
                        position: start + end,
                        detail: "implausible length suffix".to_string(),
                    }
                })? as u64;
                if size > end {
                    return Err(Error::CorruptRecord {
                        position: start + end,
                        detail: format!("length suffix {size} runs past chunk start"),
                    });
                }
                (end - size, start + end - size)
            }
        };
        match self.read_frame(physical)? {
            Some((record, _)) => {
                self.check_position(&record, expected)?;
                Ok(Some(record))
            }
            None => Err(Error::CorruptRecord {
                position: expected,
                detail: "record truncated inside written data".to_string(),
            }),
        }
    }

    /// Iterate forward over the chunk's records starting at `from`.
    pub fn scan_forward(self: &Arc<Self>, from: u64) -> ChunkScan {
        ChunkScan {
            chunk: Arc::clone(self),
            cursor: from,
            forward: true,
            done: false,
        }
    }

    /// Iterate backward over the chunk's records that start before `before`.
    pub fn scan_backward(self: &Arc<Self>, before: u64) -> ChunkScan {
        ChunkScan {
            chunk: Arc::clone(self),
            cursor: before,
            forward: false,
            done: false,
        }
    }

    /// Rename the chunk file, keeping open handles valid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the rename or directory sync fails.
    pub fn rename_to(&self, new_path: &Path) -> Result<(), Error> {
        let mut path = self.path.lock().expect("chunk path Mutex poisoned");
        std::fs::rename(&*path, new_path)?;
        sync_parent_dir(new_path)?;
        *path = new_path.to_path_buf();
        Ok(())
    }

    /// Delete the chunk file once the last handle to it is dropped.
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    fn out_of_range(&self, position: u64) -> Error {
        Error::OutOfRange {
            position,
            chunk_number: self.header.start_number,
        }
    }

    fn check_position(&self, record: &LogRecord, expected: u64) -> Result<(), Error> {
        if record.log_position() != expected {
            return Err(Error::CorruptRecord {
                position: expected,
                detail: format!(
                    "record claims log position {}, found at {expected}",
                    record.log_position()
                ),
            });
        }
        Ok(())
    }

    /// Decode one frame at `physical` (offset within the data region), bounded by the
    /// written length. `None` if the frame is incomplete.
    fn read_frame(&self, physical: u64) -> Result<Option<(LogRecord, usize)>, Error> {
        let limit = self.written_len.load(Ordering::Acquire);
        if physical + 4 > limit {
            return Ok(None);
        }
        let prefix = self.read_physical(physical, 4)?;
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
        let total = (len + 8).min(limit - physical);
        let buf = self.read_physical(physical, total as usize)?;
        match codec::decode_record(&buf) {
            Ok(DecodeOutcome::Complete { value, consumed }) => Ok(Some((value, consumed))),
            Ok(DecodeOutcome::Incomplete) => Ok(None),
            Err(Error::CorruptRecord { detail, .. }) => Err(Error::CorruptRecord {
                position: self.header.start_position() + physical,
                detail,
            }),
            Err(e) => Err(e),
        }
    }

    fn read_physical(&self, physical: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        let mut file = self.reader.lock().expect("chunk reader Mutex poisoned");
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64 + physical))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn load_posmap(&self, footer: &ChunkFooter) -> Result<Vec<PosMapEntry>, Error> {
        let bytes = self.read_physical(
            footer.physical_data_size,
            footer.map_count as usize * POSMAP_ENTRY_SIZE,
        )?;
        let posmap: Vec<PosMapEntry> = bytes
            .chunks_exact(POSMAP_ENTRY_SIZE)
            .map(|raw| PosMapEntry {
                log_position: read_u64(raw, 0),
                physical_offset: read_u64(raw, 8),
            })
            .collect();
        if posmap.windows(2).any(|w| w[0].log_position >= w[1].log_position) {
            return Err(Error::InvalidHeader(format!(
                "position map of {} is not sorted",
                self.path().display()
            )));
        }
        Ok(posmap)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if !self.delete_on_drop.load(Ordering::Acquire) {
            return;
        }
        let path = match self.path.get_mut() {
            Ok(path) => path.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "deleted replaced chunk"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to delete replaced chunk"
            ),
        }
    }
}

/// Lazy iterator over the records of one chunk.
///
/// Yields `(record, cursor)` where `cursor` is the position to resume from in the same
/// direction: the position just past the record when scanning forward, the record's
/// own position when scanning backward. Stops at the chunk boundary, at a truncated
/// trailing frame, or after the first error.
pub struct ChunkScan {
    chunk: Arc<Chunk>,
    cursor: u64,
    forward: bool,
    done: bool,
}

impl ChunkScan {
    /// Position the scan would resume from.
    pub fn position(&self) -> u64 {
        self.cursor
    }
}

impl Iterator for ChunkScan {
    type Item = Result<(LogRecord, u64), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = if self.forward {
            self.chunk.read_next(self.cursor)
        } else {
            self.chunk
                .read_prev(self.cursor)
                .map(|r| r.map(|rec| {
                    let pos = rec.log_position();
                    (rec, pos)
                }))
        };
        match step {
            Ok(Some((record, cursor))) => {
                self.cursor = cursor;
                Some(Ok((record, cursor)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Check whether a decodable record exists in `data` after byte offset `start`.
///
/// Scans forward one byte at a time from `start + 1`. Returns `true` if found, which
/// means the corrupt region is not at the tail.
/// Bytes read from the data region of a tail chunk per refill during recovery.
const RECOVERY_READ_SIZE: u64 = 64 * 1024;

/// Forward-only read window over the data region of a tail chunk.
///
/// Holds the bytes from `base` to the last refill; memory stays bounded by one
/// record frame plus one read block.
struct DataWindow<'a> {
    file: &'a mut File,
    /// Data offset of `buf[0]`.
    base: u64,
    buf: Vec<u8>,
    /// Data bytes not read from the file yet.
    remaining: u64,
}

impl<'a> DataWindow<'a> {
    fn new(file: &'a mut File, data_len: u64) -> Result<DataWindow<'a>, Error> {
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64))?;
        Ok(DataWindow {
            file,
            base: 0,
            buf: Vec::new(),
            remaining: data_len,
        })
    }

    /// Buffered bytes starting at data offset `offset` (`>= base`).
    fn bytes_from(&self, offset: u64) -> &[u8] {
        let start = usize::try_from(offset - self.base)
            .unwrap_or(usize::MAX)
            .min(self.buf.len());
        &self.buf[start..]
    }

    /// Discard bytes before `offset` and read the next block. Returns `false` once
    /// the whole data region has been read.
    fn advance(&mut self, offset: u64) -> Result<bool, Error> {
        if self.remaining == 0 {
            return Ok(false);
        }
        let discard = usize::try_from(offset - self.base)
            .unwrap_or(usize::MAX)
            .min(self.buf.len());
        self.buf.drain(..discard);
        self.base += discard as u64;

        let block = RECOVERY_READ_SIZE.min(self.remaining) as usize;
        let filled = self.buf.len();
        self.buf.resize(filled + block, 0);
        self.file.read_exact(&mut self.buf[filled..])?;
        self.remaining -= block as u64;
        Ok(true)
    }

    /// `true` if a complete, valid record starts at any offset after `start`.
    /// Consumes the window.
    fn has_valid_record_after(&mut self, start: u64) -> Result<bool, Error> {
        let mut candidate = start + 1;
        loop {
            if candidate >= self.base + self.buf.len() as u64 && !self.advance(candidate)? {
                return Ok(false);
            }
            match codec::decode_record(self.bytes_from(candidate)) {
                Ok(DecodeOutcome::Complete { .. }) => return Ok(true),
                Ok(DecodeOutcome::Incomplete) => {
                    if !self.advance(candidate)? {
                        candidate += 1;
                    }
                }
                Err(_) => candidate += 1,
            }
        }
    }
}

fn read_footer(file: &mut File, file_len: u64) -> Result<Option<ChunkFooter>, Error> {
    if file_len < (CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE) as u64 {
        return Ok(None);
    }
    let mut buf = [0u8; CHUNK_FOOTER_SIZE];
    file.seek(SeekFrom::Start(file_len - CHUNK_FOOTER_SIZE as u64))?;
    file.read_exact(&mut buf)?;
    Ok(ChunkFooter::decode(&buf))
}

/// Fsync the directory containing `path` so a created or renamed entry is durable.
pub(crate) fn sync_parent_dir(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        File::open(parent)?.sync_all()?;
        #[cfg(not(unix))]
        let _ = parent;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CommitLogRecord, PrepareLogRecord, encode_record};
    use crate::types::{ExpectedVersion, PrepareFlags};
    use bytes::Bytes;
    use uuid::Uuid;

    const CHUNK_SIZE: u64 = 4096;

    fn prepare_at(log_position: u64, data: &[u8]) -> LogRecord {
        LogRecord::Prepare(PrepareLogRecord {
            log_position,
            transaction_position: log_position,
            transaction_offset: 0,
            expected_version: ExpectedVersion::Any,
            stream_id: "chunk-test".to_string(),
            event_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            event_type: "Tested".to_string(),
            timestamp: 1,
            flags: PrepareFlags::DATA
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
            data: Bytes::copy_from_slice(data),
            metadata: Bytes::new(),
        })
    }

    /// Append `n` prepares to `chunk`, returning them as written.
    fn fill(chunk: &Chunk, n: usize) -> Vec<LogRecord> {
        let mut written = Vec::new();
        let mut position = chunk.data_end_position();
        for i in 0..n {
            let record = prepare_at(position, format!("event-{i}").as_bytes());
            match chunk.append(&encode_record(&record)).expect("append") {
                ChunkAppend::Written {
                    log_position,
                    next_position,
                } => {
                    assert_eq!(log_position, position);
                    position = next_position;
                }
                ChunkAppend::Full => panic!("chunk unexpectedly full"),
            }
            written.push(record);
        }
        chunk.flush().expect("flush");
        written
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(chunk_file_name(3, 1), "chunk-000003.000001");
        assert_eq!(parse_chunk_file_name("chunk-000003.000001"), Some((3, 1)));
        assert_eq!(parse_chunk_file_name("chunk-000003.000001.scavenge.tmp"), None);
        assert_eq!(parse_chunk_file_name("writer.chk"), None);
    }

    #[test]
    fn header_rejects_bad_magic_and_crc() {
        let header = ChunkHeader {
            chunk_size: CHUNK_SIZE,
            start_number: 2,
            end_number: 3,
            generation: 1,
        };
        let mut buf = header.encode();
        assert_eq!(ChunkHeader::decode(&buf).expect("decode"), header);
        assert_eq!(header.start_position(), 2 * CHUNK_SIZE);
        assert_eq!(header.end_position(), 4 * CHUNK_SIZE);

        buf[10] ^= 0xFF;
        assert!(matches!(
            ChunkHeader::decode(&buf),
            Err(Error::InvalidHeader(_))
        ));
        buf[0] = b'X';
        assert!(matches!(
            ChunkHeader::decode(&buf),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn append_and_read_back_by_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        let written = fill(&chunk, 3);

        for record in &written {
            let read = chunk
                .read_at(record.log_position())
                .expect("read")
                .expect("present");
            assert_eq!(&read, record);
        }
        let end = chunk.data_end_position();
        assert!(matches!(
            chunk.read_at(end),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn append_reports_full_when_capacity_exceeded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, 256).expect("create");
        let big = encode_record(&prepare_at(0, &[7u8; 200]));
        assert!(matches!(
            chunk.append(&big).expect("first"),
            ChunkAppend::Written { .. }
        ));
        let second = encode_record(&prepare_at(big.len() as u64, &[7u8; 200]));
        assert_eq!(chunk.append(&second).expect("second"), ChunkAppend::Full);
    }

    #[test]
    fn scans_are_symmetric() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        let written = fill(&chunk, 5);

        let forward: Vec<LogRecord> = chunk
            .scan_forward(0)
            .map(|r| r.expect("forward").0)
            .collect();
        let mut backward: Vec<LogRecord> = chunk
            .scan_backward(u64::MAX)
            .map(|r| r.expect("backward").0)
            .collect();
        backward.reverse();

        assert_eq!(forward, written);
        assert_eq!(backward, written);
    }

    #[test]
    fn scan_is_restartable_from_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        let written = fill(&chunk, 4);

        let mut scan = chunk.scan_forward(0);
        scan.next().expect("first").expect("ok");
        let (second, cursor) = scan.next().expect("second").expect("ok");
        assert_eq!(second, written[1]);
        assert_eq!(scan.position(), cursor);
        let rest: Vec<LogRecord> = chunk
            .scan_forward(cursor)
            .map(|r| r.expect("ok").0)
            .collect();
        assert_eq!(rest, written[2..].to_vec());
    }

    #[test]
    fn completed_chunk_reopens_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        let written = fill(&chunk, 2);
        chunk.complete().expect("complete");
        assert!(chunk.is_completed());
        chunk.verify().expect("verify fresh chunk");

        let err = chunk
            .append(&encode_record(&prepare_at(0, b"late")))
            .expect_err("append after complete");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let path = chunk.path();
        drop(chunk);
        let reopened = Chunk::open(&path).expect("reopen");
        assert!(reopened.is_completed());
        reopened.verify().expect("verify reopened");
        let records: Vec<LogRecord> = reopened
            .scan_forward(0)
            .map(|r| r.expect("ok").0)
            .collect();
        assert_eq!(records, written);
    }

    #[test]
    fn open_truncates_partial_trailing_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        let written = fill(&chunk, 2);
        let valid_end = chunk.data_end_position();
        let path = chunk.path();
        drop(chunk);

        // Simulate a crash in the middle of writing a third record.
        let partial = encode_record(&prepare_at(valid_end, b"never finished"));
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(&partial[..partial.len() / 2]).expect("write");
        drop(file);

        let reopened = Chunk::open(&path).expect("reopen");
        assert!(!reopened.is_completed());
        assert_eq!(reopened.data_end_position(), valid_end);
        assert_eq!(
            std::fs::metadata(&path).expect("meta").len(),
            CHUNK_HEADER_SIZE as u64 + valid_end
        );
        let records: Vec<LogRecord> = reopened
            .scan_forward(0)
            .map(|r| r.expect("ok").0)
            .collect();
        assert_eq!(records, written);
    }

    #[test]
    fn open_rejects_mid_chunk_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        fill(&chunk, 3);
        let path = chunk.path();
        drop(chunk);

        let mut bytes = std::fs::read(&path).expect("read");
        bytes[CHUNK_HEADER_SIZE + 20] ^= 0xFF;
        std::fs::write(&path, &bytes).expect("write");

        assert!(matches!(
            Chunk::open(&path),
            Err(Error::CorruptRecord { .. })
        ));
    }

    /// Append `n` prepares of `size` data bytes each, enough to span several recovery
    /// read blocks.
    fn fill_large(chunk: &Chunk, n: usize, size: usize) -> Vec<LogRecord> {
        let mut written = Vec::new();
        for i in 0..n {
            let record = prepare_at(chunk.data_end_position(), &vec![i as u8; size]);
            assert!(matches!(
                chunk.append(&encode_record(&record)).expect("append"),
                ChunkAppend::Written { .. }
            ));
            written.push(record);
        }
        chunk.flush().expect("flush");
        written
    }

    #[test]
    fn open_truncates_torn_tail_beyond_first_read_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, 1 << 20).expect("create");
        let written = fill_large(&chunk, 40, 8 * 1024);
        let valid_end = chunk.data_end_position();
        assert!(valid_end > 4 * RECOVERY_READ_SIZE);
        let path = chunk.path();
        drop(chunk);

        let partial = encode_record(&prepare_at(valid_end, &[7u8; 8 * 1024]));
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(&partial[..partial.len() - 10]).expect("write");
        drop(file);

        let reopened = Chunk::open(&path).expect("reopen");
        assert_eq!(reopened.data_end_position(), valid_end);
        let records: Vec<LogRecord> = reopened
            .scan_forward(0)
            .map(|r| r.expect("ok").0)
            .collect();
        assert_eq!(records, written);
    }

    #[test]
    fn open_truncates_long_garbage_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, 1 << 20).expect("create");
        fill_large(&chunk, 3, 1024);
        let valid_end = chunk.data_end_position();
        let path = chunk.path();
        drop(chunk);

        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(&vec![0xAB; 3 * RECOVERY_READ_SIZE as usize])
            .expect("write");
        drop(file);

        let reopened = Chunk::open(&path).expect("reopen");
        assert_eq!(reopened.data_end_position(), valid_end);
        assert_eq!(
            std::fs::metadata(&path).expect("meta").len(),
            CHUNK_HEADER_SIZE as u64 + valid_end
        );
    }

    #[test]
    fn open_finds_valid_records_after_corruption_in_later_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, 1 << 20).expect("create");
        fill_large(&chunk, 20, 16 * 1024);
        let path = chunk.path();
        drop(chunk);

        let mut bytes = std::fs::read(&path).expect("read");
        bytes[CHUNK_HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, &bytes).expect("write");

        assert!(matches!(
            Chunk::open(&path),
            Err(Error::CorruptRecord { position: 0, .. })
        ));
    }

    #[test]
    fn scavenge_target_keeps_original_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        let written = fill(&source, 4);
        source.complete().expect("complete");

        let header = ChunkHeader {
            generation: 1,
            ..*source.header()
        };
        let target = Chunk::create_scavenge_target(
            dir.path(),
            header,
            source.footer().expect("footer").logical_data_size,
        )
        .expect("target");
        for keep in [&written[1], &written[3]] {
            target
                .append_at(keep.log_position(), &encode_record(keep))
                .expect("append_at");
        }
        target.complete().expect("complete target");
        assert!(target.is_scavenged());
        target.verify().expect("verify target");

        assert_eq!(
            target.read_at(written[1].log_position()).expect("read"),
            Some(written[1].clone())
        );
        assert_eq!(target.read_at(written[0].log_position()).expect("read"), None);
        assert_eq!(target.data_end_position(), source.data_end_position());

        let path = target.path();
        drop(target);
        let reopened = Chunk::open(&path).expect("reopen target");
        let forward: Vec<LogRecord> = reopened
            .scan_forward(0)
            .map(|r| r.expect("ok").0)
            .collect();
        assert_eq!(forward, vec![written[1].clone(), written[3].clone()]);
        let backward: Vec<LogRecord> = reopened
            .scan_backward(u64::MAX)
            .map(|r| r.expect("ok").0)
            .collect();
        assert_eq!(backward, vec![written[3].clone(), written[1].clone()]);
    }

    #[test]
    fn append_at_rejects_non_increasing_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let header = ChunkHeader {
            chunk_size: CHUNK_SIZE,
            start_number: 0,
            end_number: 0,
            generation: 1,
        };
        let target = Chunk::create_scavenge_target(dir.path(), header, 0).expect("target");
        let commit = LogRecord::Commit(CommitLogRecord {
            log_position: 100,
            transaction_position: 0,
            first_event_number: 0,
            timestamp: 0,
            correlation_id: Uuid::new_v4(),
        });
        target.append_at(100, &encode_record(&commit)).expect("first");
        assert!(matches!(
            target.append_at(100, &encode_record(&commit)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn marked_chunk_is_deleted_after_last_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chunk = Chunk::create_new(dir.path(), 0, CHUNK_SIZE).expect("create");
        fill(&chunk, 1);
        let path = chunk.path();
        let reader = Arc::clone(&chunk);

        chunk.mark_for_deletion();
        drop(chunk);
        assert!(path.exists(), "a live handle keeps the file");
        assert!(reader.read_at(0).expect("read").is_some());

        drop(reader);
        assert!(!path.exists(), "file removed with the last handle");
    }
}
