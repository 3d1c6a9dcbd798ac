//! The chunk manager: an ordered set of chunk files forming one logical log.
//!
//! [`ChunkDb`] owns the `Arc<Chunk>` handles and the checkpoints. It is the single
//! place that maps a log position to a chunk, rolls the tail over when it fills up,
//! and swaps in scavenged chunks. Chunk lists handed to readers are snapshots: a
//! scan started before a replacement keeps reading the old generation until it is
//! dropped.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::checkpoint::Checkpoints;
use crate::chunk::{
    CHUNK_HEADER_SIZE, Chunk, ChunkAppend, ChunkHeader, ChunkScan, chunk_file_name,
    parse_chunk_file_name,
};
use crate::codec::{LogRecord, encode_record};
use crate::config::StorageConfig;
use crate::error::Error;

/// The chunked transaction log.
#[derive(Debug)]
pub struct ChunkDb {
    dir: PathBuf,
    chunk_size: u64,
    checkpoints: Checkpoints,
    /// Sorted by start number, contiguous; the last one is the writable tail.
    chunks: RwLock<Vec<Arc<Chunk>>>,
}

impl ChunkDb {
    /// Open (or create) the log in `config.data_dir`.
    ///
    /// Recovery steps:
    /// 1. Delete leftover `*.tmp` files from interrupted scavenges or checkpoint
    ///    writes.
    /// 2. For each start number keep the highest generation; delete files superseded
    ///    by a higher generation or covered by a merged chunk.
    /// 3. Check the remaining chunks are contiguous from chunk 0.
    /// 4. Open the last chunk as tail (truncating a torn trailing record), or create
    ///    a new tail if it is complete or the directory is empty.
    /// 5. Reset the Writer checkpoint from the tail's length and clamp the others.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] on a gap in the chunk sequence or an
    /// unreadable header, [`Error::CorruptRecord`] on mid-chunk corruption (or a
    /// data CRC mismatch when `verify_hashes` is set), [`Error::Io`] on I/O failure.
    pub fn open(
        dir: &Path,
        config: &StorageConfig,
        checkpoints: Checkpoints,
    ) -> Result<ChunkDb, Error> {
        std::fs::create_dir_all(dir)?;

        let mut candidates: Vec<(PathBuf, ChunkHeader)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let path = entry.path();
            if name.ends_with(".tmp") {
                tracing::info!(path = %path.display(), "removing leftover temp file");
                std::fs::remove_file(&path)?;
                continue;
            }
            let Some((start, generation)) = parse_chunk_file_name(name) else {
                continue;
            };
            let header = read_header(&path)?;
            if header.start_number != start || header.generation != generation {
                return Err(Error::InvalidHeader(format!(
                    "chunk file {} has header for chunk {}.{}",
                    path.display(),
                    header.start_number,
                    header.generation
                )));
            }
            if header.chunk_size != config.chunk_size {
                return Err(Error::InvalidHeader(format!(
                    "chunk file {} has chunk size {}, configured {}",
                    path.display(),
                    header.chunk_size,
                    config.chunk_size
                )));
            }
            candidates.push((path, header));
        }

        // Highest generation first within a start number.
        candidates.sort_by(|(_, a), (_, b)| {
            a.start_number
                .cmp(&b.start_number)
                .then(b.generation.cmp(&a.generation))
        });

        let mut selected: Vec<(PathBuf, ChunkHeader)> = Vec::new();
        for (path, header) in candidates {
            let superseded = selected
                .last()
                .is_some_and(|(_, last)| header.start_number <= last.end_number);
            if superseded {
                tracing::info!(path = %path.display(), "removing superseded chunk file");
                std::fs::remove_file(&path)?;
                continue;
            }
            selected.push((path, header));
        }

        let mut expected_start = 0u32;
        for (path, header) in &selected {
            if header.start_number != expected_start {
                return Err(Error::InvalidHeader(format!(
                    "gap in chunk sequence: expected chunk {expected_start}, found {}",
                    path.display()
                )));
            }
            expected_start = header.end_number + 1;
        }

        let mut chunks = Vec::with_capacity(selected.len() + 1);
        let last_index = selected.len().saturating_sub(1);
        for (i, (path, _)) in selected.iter().enumerate() {
            let chunk = Chunk::open(path)?;
            if i < last_index && !chunk.is_completed() {
                tracing::warn!(path = %path.display(), "completing interior chunk left open");
                chunk.complete()?;
            }
            if config.verify_hashes && chunk.is_completed() {
                chunk.verify()?;
            }
            chunks.push(chunk);
        }

        match chunks.last() {
            None => chunks.push(Chunk::create_new(dir, 0, config.chunk_size)?),
            Some(last) if last.is_completed() => {
                let next = last.header().end_number + 1;
                chunks.push(Chunk::create_new(dir, next, config.chunk_size)?);
            }
            Some(_) => {}
        }

        let tail = chunks
            .last()
            .ok_or_else(|| Error::InvalidHeader("no tail chunk".into()))?;
        let writer_position = tail.data_end_position();
        checkpoints.recover(writer_position)?;

        tracing::info!(
            dir = %dir.display(),
            chunks = chunks.len(),
            writer = writer_position,
            "opened chunk database"
        );

        Ok(ChunkDb {
            dir: dir.to_path_buf(),
            chunk_size: config.chunk_size,
            checkpoints,
            chunks: RwLock::new(chunks),
        })
    }

    /// Directory holding the chunk files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Logical chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// The Writer, Chaser and Epoch checkpoints.
    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    /// Position the next record will be written at (non-flushed Writer).
    pub fn writer_position(&self) -> u64 {
        self.checkpoints.writer_position()
    }

    /// Durable Writer position.
    pub fn flushed_writer_position(&self) -> u64 {
        self.checkpoints.writer.read().max(0) as u64
    }

    /// Snapshot of all chunk handles, in log order.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().expect("chunk list RwLock poisoned").clone()
    }

    /// Completed chunks, i.e. every chunk except the writable tail.
    pub fn completed_chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks()
            .into_iter()
            .filter(|chunk| chunk.is_completed())
            .collect()
    }

    fn tail(&self) -> Result<Arc<Chunk>, Error> {
        self.chunks
            .read()
            .expect("chunk list RwLock poisoned")
            .last()
            .cloned()
            .ok_or_else(|| Error::InvalidHeader("chunk database has no tail".into()))
    }

    /// Append a record at the Writer position and return the position it landed at.
    ///
    /// `record.log_position()` must equal [`ChunkDb::writer_position`]. If the tail
    /// is full the tail is completed, a new chunk is created, and the record is moved
    /// to the new chunk's start (a self-started transaction moves with it). The write
    /// is not durable until [`ChunkDb::flush`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the record is not positioned at the
    /// Writer, [`Error::EventTooLarge`] if it cannot fit in an empty chunk, and
    /// [`Error::Io`] on write failure.
    pub fn append_record(&self, record: &LogRecord) -> Result<u64, Error> {
        let position = self.writer_position();
        if record.log_position() != position {
            return Err(Error::InvalidArgument(format!(
                "record positioned at {}, writer at {position}",
                record.log_position()
            )));
        }
        let mut encoded = encode_record(record);
        if encoded.len() as u64 > self.chunk_size {
            return Err(Error::EventTooLarge {
                size: encoded.len(),
                max: self.chunk_size as usize,
            });
        }

        let tail = self.tail()?;
        match tail.append(&encoded)? {
            ChunkAppend::Written {
                log_position,
                next_position,
            } => {
                self.checkpoints.writer.write(next_position as i64);
                return Ok(log_position);
            }
            ChunkAppend::Full => {}
        }

        let new_tail = self.roll_over(&tail)?;
        let moved = record.at_position(new_tail.header().start_position());
        encoded = encode_record(&moved);
        match new_tail.append(&encoded)? {
            ChunkAppend::Written {
                log_position,
                next_position,
            } => {
                self.checkpoints.writer.write(next_position as i64);
                Ok(log_position)
            }
            ChunkAppend::Full => Err(Error::EventTooLarge {
                size: encoded.len(),
                max: self.chunk_size as usize,
            }),
        }
    }

    /// Complete `tail`, create the next chunk and advance Writer to its start.
    fn roll_over(&self, tail: &Arc<Chunk>) -> Result<Arc<Chunk>, Error> {
        tail.complete()?;
        let next_number = tail.header().end_number + 1;
        let next = Chunk::create_new(&self.dir, next_number, self.chunk_size)?;
        let next_start = next.header().start_position();

        self.chunks
            .write()
            .expect("chunk list RwLock poisoned")
            .push(Arc::clone(&next));
        self.checkpoints.writer.write(next_start as i64);
        self.checkpoints.writer.flush()?;

        tracing::info!(chunk = next_number, position = next_start, "rolled over to new chunk");
        Ok(next)
    }

    /// Fsync the tail, then persist the Writer checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if either sync fails.
    pub fn flush(&self) -> Result<(), Error> {
        self.tail()?.flush()?;
        self.checkpoints.writer.flush()
    }

    /// The chunk covering `position`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PositionNotFound`] if `position` is at or beyond the Writer.
    pub fn chunk_for(&self, position: u64) -> Result<Arc<Chunk>, Error> {
        if position >= self.writer_position() {
            return Err(Error::PositionNotFound { position });
        }
        let chunks = self.chunks.read().expect("chunk list RwLock poisoned");
        let idx = chunks.partition_point(|c| c.header().end_position() <= position);
        chunks
            .get(idx)
            .filter(|c| c.header().start_position() <= position)
            .cloned()
            .ok_or(Error::PositionNotFound { position })
    }

    /// Read the record at `position`; `None` if it was scavenged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PositionNotFound`] beyond the Writer and [`Error::OutOfRange`]
    /// for positions inside a chunk's unused space.
    pub fn read_record(&self, position: u64) -> Result<Option<LogRecord>, Error> {
        self.chunk_for(position)?.read_at(position)
    }

    /// Lazily iterate records with `from <= log_position < horizon` in log order.
    pub fn scan_forward(&self, from: u64, horizon: u64) -> LogScan {
        LogScan::forward(self.chunks(), from, horizon)
    }

    /// Lazily iterate records with `log_position < before` in reverse log order.
    pub fn scan_backward(&self, before: u64) -> LogScan {
        LogScan::backward(self.chunks(), before)
    }

    /// Swap a completed scavenge target in for the chunks it covers.
    ///
    /// The new chunk must exactly cover the logical range of one or more existing
    /// completed chunks. Its temp file is renamed to its final name and the
    /// directory fsynced before the in-memory mapping is swapped; the replaced
    /// chunks are deleted once no reader holds them. Returns the replaced chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the new chunk is not completed, its
    /// range does not line up with existing chunk boundaries, it covers the tail, or
    /// its generation does not exceed the replaced ones. [`Error::Io`] if the rename
    /// fails.
    pub fn replace_chunks(&self, new_chunk: Arc<Chunk>) -> Result<Vec<Arc<Chunk>>, Error> {
        if !new_chunk.is_completed() {
            return Err(Error::InvalidArgument(
                "replacement chunk must be completed".into(),
            ));
        }
        let header = *new_chunk.header();
        let mut chunks = self.chunks.write().expect("chunk list RwLock poisoned");

        let first = chunks
            .iter()
            .position(|c| c.header().start_number == header.start_number);
        let last = chunks
            .iter()
            .position(|c| c.header().end_number == header.end_number);
        let (first, last) = match (first, last) {
            (Some(first), Some(last)) if first <= last => (first, last),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "chunk range {}..={} does not match existing chunk boundaries",
                    header.start_number, header.end_number
                )));
            }
        };
        if last + 1 >= chunks.len() {
            return Err(Error::InvalidArgument(
                "the tail chunk cannot be replaced".into(),
            ));
        }
        if chunks[first..=last]
            .iter()
            .any(|c| c.header().generation >= header.generation)
        {
            return Err(Error::InvalidArgument(format!(
                "replacement generation {} does not supersede existing chunks",
                header.generation
            )));
        }

        let final_path = self
            .dir
            .join(chunk_file_name(header.start_number, header.generation));
        new_chunk.rename_to(&final_path)?;

        let replaced: Vec<Arc<Chunk>> = chunks.splice(first..=last, [new_chunk]).collect();
        drop(chunks);

        for old in &replaced {
            old.mark_for_deletion();
        }
        tracing::info!(
            start = header.start_number,
            end = header.end_number,
            generation = header.generation,
            replaced = replaced.len(),
            "replaced chunks"
        );
        Ok(replaced)
    }
}

fn read_header(path: &Path) -> Result<ChunkHeader, Error> {
    use std::io::Read;
    let mut buf = [0u8; CHUNK_HEADER_SIZE];
    std::fs::File::open(path)?
        .read_exact(&mut buf)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::InvalidHeader(format!(
                "chunk file {} too short for header",
                path.display()
            )),
            _ => Error::Io(e),
        })?;
    ChunkHeader::decode(&buf)
}

/// Lazy iterator over records spanning several chunks.
///
/// Holds a snapshot of the chunk list, so a concurrent scavenge replacement does not
/// disturb a scan in progress. Yields `(record, cursor)` with the same cursor
/// meaning as [`ChunkScan`].
pub struct LogScan {
    chunks: Vec<Arc<Chunk>>,
    /// Index into `chunks` of the chunk being scanned.
    index: usize,
    current: Option<ChunkScan>,
    forward: bool,
    horizon: u64,
    done: bool,
}

impl LogScan {
    fn forward(chunks: Vec<Arc<Chunk>>, from: u64, horizon: u64) -> LogScan {
        let index = chunks.partition_point(|c| c.header().end_position() <= from);
        let current = chunks.get(index).map(|c| c.scan_forward(from));
        LogScan {
            done: current.is_none(),
            chunks,
            index,
            current,
            forward: true,
            horizon,
        }
    }

    fn backward(chunks: Vec<Arc<Chunk>>, before: u64) -> LogScan {
        let count = chunks.partition_point(|c| c.header().start_position() < before);
        let (index, current) = match count.checked_sub(1) {
            Some(index) => (index, Some(chunks[index].scan_backward(before))),
            None => (0, None),
        };
        LogScan {
            done: current.is_none(),
            chunks,
            index,
            current,
            forward: false,
            horizon: 0,
        }
    }

    fn advance_chunk(&mut self) -> bool {
        if self.forward {
            self.index += 1;
            match self.chunks.get(self.index) {
                Some(chunk) => {
                    self.current = Some(chunk.scan_forward(chunk.header().start_position()));
                    true
                }
                None => false,
            }
        } else {
            match self.index.checked_sub(1) {
                Some(index) => {
                    self.index = index;
                    let chunk = &self.chunks[index];
                    self.current = Some(chunk.scan_backward(chunk.header().end_position()));
                    true
                }
                None => false,
            }
        }
    }
}

impl Iterator for LogScan {
    type Item = Result<(LogRecord, u64), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let step = self.current.as_mut().and_then(Iterator::next);
            match step {
                Some(Ok((record, cursor))) => {
                    if self.forward && record.log_position() >= self.horizon {
                        self.done = true;
                        return None;
                    }
                    return Some(Ok((record, cursor)));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    if !self.advance_chunk() {
                        self.done = true;
                    }
                }
            }
        }
        None
    }
}
