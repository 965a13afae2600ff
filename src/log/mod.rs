//! The persistent commit log: a single append-only file holding any number
//! of named byte streams, with prefix truncation ("pollard") and, once
//! sealed, an embedded dictionary for random-access reads.
//!
//! # File Format
//!
//! An unsealed log is a plain sequence of append and pollard records; a
//! sealed log ends with a dictionary record and a fixed trailer. There is no
//! file header.
//!
//! ```text
//! +--------------------+
//! | append record      |
//! +--------------------+
//! | append record      |
//! +--------------------+
//! | pollard record     |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | dict record        |  sealed logs only
//! +--------------------+
//! | dictLen:u64 magic:8|  16-byte trailer
//! +--------------------+
//! ```
//!
//! Record layouts live in `action`; the dictionary layout in `dict`. All
//! multi-byte integers are little-endian.
//!
//! # Durability
//!
//! `commit` returns only after the record's bytes are flushed and fsynced,
//! so at most the final record of a crashed log can be torn. Recovery
//! replays the file up to the first short or garbage record and truncates
//! the rest, which removes exactly that torn suffix.
//!
//! The in-memory fragment-allocation table mirrors the file: it is mutated
//! only after a record is durable, so every extent it surfaces points at
//! synced bytes and positioned reads may run concurrently with the writer's
//! buffered appends.

pub mod action;
pub(crate) mod dict;
pub(crate) mod fat;
pub mod reader;
pub(crate) mod recovery;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::span::Span;
use crate::{errinput, Error};

use action::Action;
use fat::{Fat, StreamLog};

/// A writable log file. One writer per log; readers of the same open log go
/// through [`CommitLog::read_stream`], which uses positioned reads and never
/// disturbs the append position.
pub struct CommitLog {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    streams: HashMap<Vec<u8>, StreamLog>,
    fat: Fat,
    size: u64,
    finalized: bool,
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("streams", &self.streams.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl CommitLog {
    /// Creates a new empty log at `path`, truncating any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), "created log");
        Self::attach(file, path, 0)
    }

    /// Opens an existing log, replaying its records and truncating any torn
    /// tail. Fails with [`Error::Finalized`] when the file is sealed; sealed
    /// files are served by [`reader::LogReader`] instead.
    pub fn recover(path: impl AsRef<Path>) -> Result<Self> {
        recovery::recover(path.as_ref())
    }

    /// Wraps an open file handle positioned for appends at `size`.
    fn attach(file: File, path: &Path, size: u64) -> Result<Self> {
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            path: path.to_path_buf(),
            streams: HashMap::new(),
            fat: Fat::new(),
            size,
            finalized: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte count of all durable records, which is also the append position.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Durably appends one action. On success the record is flushed and
    /// fsynced and the in-memory state reflects it; on failure the in-memory
    /// state is untouched.
    pub fn commit(&mut self, action: &Action) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        self.check_capacity(action)?;
        if let Action::Pollard { pollard_pos, .. } = action {
            self.check_pollard(action.stream(), action.offset(), *pollard_pos)?;
        }

        let known = self.streams.get(action.stream()).map(|s| s.number);
        let record = action::encode(action, known)?;

        self.writer.write_all(&record.bytes)?;
        self.writer.flush()?;
        self.file.sync_all()?;

        self.apply(action, record.prefix_len);
        self.size += record.bytes.len() as u64;
        Ok(())
    }

    /// The live range of a stream in this log, `[keep_offset, end_offset)`.
    pub fn stream_range(&self, stream: &[u8]) -> Result<Span> {
        let s = self.streams.get(stream).ok_or(Error::NotFound)?;
        Ok(s.span())
    }

    /// Fills `buf` with stream bytes starting at `offset`. The requested
    /// range must lie entirely within the stream's live range.
    pub fn read_stream(&self, stream: &[u8], offset: u64, buf: &mut [u8]) -> Result<()> {
        let s = self.streams.get(stream).ok_or(Error::NotFound)?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::InvalidInput("read range overflows".into()))?;
        if offset < s.keep_offset || end > s.end_offset() {
            return errinput!(
                "read [{offset}, {end}) outside live range [{}, {})",
                s.keep_offset,
                s.end_offset()
            );
        }
        if buf.is_empty() {
            return Ok(());
        }

        // Walk to the extent containing `offset`, tracking the stream offset
        // at which the current extent begins.
        let mut foffset = s.base_offset;
        let mut index = s.first_fat;
        loop {
            let entry = self.fat.entry(index)?;
            if offset < foffset + entry.length as u64 {
                break;
            }
            foffset += entry.length as u64;
            index = entry.next;
        }

        let mut offset = offset;
        let mut done = 0;
        while done < buf.len() {
            let entry = self.fat.entry(index)?;
            let pos_offset = offset - foffset;
            let avail = entry.length as u64 - pos_offset;
            let count = avail.min((buf.len() - done) as u64) as usize;
            read_exact_at(&self.file, &mut buf[done..done + count], entry.pos + pos_offset)?;
            done += count;
            offset += count as u64;
            foffset += entry.length as u64;
            index = entry.next;
        }
        Ok(())
    }

    /// Seals the log: appends the sorted dictionary and trailer, fsyncs, and
    /// rejects all further mutations.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        let blob = dict::encode(&self.streams, &self.fat)?;
        self.writer.write_all(&blob)?;
        self.writer.flush()?;
        self.file.sync_all()?;
        self.size += blob.len() as u64;
        self.finalized = true;
        info!(
            path = %self.path.display(),
            streams = self.streams.len(),
            dict_bytes = blob.len(),
            "sealed log"
        );
        Ok(())
    }

    /// Closes the log without sealing it. The file can be re-opened later
    /// with [`CommitLog::recover`].
    pub fn close(self) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        Ok(())
    }

    /// Rejects actions the on-disk format cannot represent before any bytes
    /// are written.
    fn check_capacity(&self, action: &Action) -> Result<()> {
        if !self.streams.contains_key(action.stream()) && self.streams.len() > u16::MAX as usize {
            return errinput!("log is full: stream ordinal space exhausted");
        }
        if matches!(action, Action::Append { .. }) && self.fat.is_full() {
            return errinput!("log is full: fragment table exhausted");
        }
        Ok(())
    }

    /// A pollard must keep the stream's offsets ordered:
    /// `base <= keep <= end`. For a stream this log has not seen, the
    /// record's offset fixes base = keep = end, so only that exact position
    /// is admissible.
    fn check_pollard(&self, stream: &[u8], offset: u64, pollard_pos: u64) -> Result<()> {
        match self.streams.get(stream) {
            Some(s) if pollard_pos >= s.keep_offset && pollard_pos <= s.end_offset() => Ok(()),
            Some(s) => errinput!(
                "pollard position {pollard_pos} outside [{}, {}]",
                s.keep_offset,
                s.end_offset()
            ),
            None if pollard_pos == offset => Ok(()),
            None => errinput!("pollard position {pollard_pos} for unknown stream must equal {offset}"),
        }
    }

    /// Applies a durable record's state mutations: ordinal assignment at
    /// first mention, FAT extension for appends, keep-offset advance for
    /// pollards. Infallible; all capacity checks happen before the write.
    fn apply(&mut self, action: &Action, prefix_len: usize) {
        let number = self.streams.len() as u16;
        let size = self.size;
        let fat = &mut self.fat;
        let stream = self
            .streams
            .entry(action.stream().to_vec())
            .or_insert_with(|| StreamLog::new(number, action.offset()));
        match action {
            Action::Append { data, .. } => {
                fat.extend(stream, size + prefix_len as u64, data.len() as u32);
                stream.length += data.len() as u64;
            }
            Action::Pollard { pollard_pos, .. } => stream.keep_offset = *pollard_pos,
        }
    }
}

/// Reads `buf.len()` bytes at absolute position `pos` without moving the
/// file's append cursor.
#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], pos: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, pos)?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut pos: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, pos) {
            Ok(0) => {
                return Err(Error::Corruption(
                    "extent points past the end of the log file".into(),
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                pos += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn append(stream: &[u8], offset: u64, data: &[u8]) -> Action {
        Action::Append {
            stream: stream.to_vec(),
            offset,
            data: data.to_vec(),
        }
    }

    fn pollard(stream: &[u8], offset: u64, pollard_pos: u64) -> Action {
        Action::Pollard {
            stream: stream.to_vec(),
            offset,
            pollard_pos,
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        log.commit(&append(b"s1", 0, b"Hello World")).expect("commit failed");
        log.commit(&append(b"s1", 11, b"!Great!")).expect("commit failed");

        assert_eq!(log.stream_range(b"s1").unwrap(), Span::new(0, 18));

        let mut buf = [0u8; 18];
        log.read_stream(b"s1", 0, &mut buf).expect("read failed");
        assert_eq!(&buf, b"Hello World!Great!");

        let mut buf = [0u8; 11];
        log.read_stream(b"s1", 6, &mut buf).expect("read failed");
        assert_eq!(&buf, b"World!Great");
    }

    #[test]
    fn test_pollard_advances_live_range() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        log.commit(&append(b"s1", 0, b"Hello World")).expect("commit failed");
        log.commit(&append(b"s1", 11, b"!Great!")).expect("commit failed");
        log.commit(&pollard(b"s1", 18, 6)).expect("commit failed");

        assert_eq!(log.stream_range(b"s1").unwrap(), Span::new(6, 18));

        let mut buf = [0u8; 12];
        log.read_stream(b"s1", 6, &mut buf).expect("read failed");
        assert_eq!(&buf, b"World!Great!");

        // Reads below the keep offset are rejected.
        let mut buf = [0u8; 1];
        assert!(matches!(
            log.read_stream(b"s1", 0, &mut buf),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_read_past_end_is_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        log.commit(&append(b"s1", 0, b"abc")).expect("commit failed");

        let mut buf = [0u8; 4];
        assert!(matches!(
            log.read_stream(b"s1", 0, &mut buf),
            Err(Error::InvalidInput(_))
        ));

        // An empty read at the exact end is fine.
        log.read_stream(b"s1", 3, &mut []).expect("empty read failed");
    }

    #[test]
    fn test_unknown_stream_is_not_found() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        assert_eq!(log.stream_range(b"nope"), Err(Error::NotFound));
        let mut buf = [0u8; 1];
        assert_eq!(log.read_stream(b"nope", 0, &mut buf), Err(Error::NotFound));
    }

    #[test]
    fn test_interleaved_streams() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        log.commit(&append(b"s1", 0, b"one")).expect("commit failed");
        log.commit(&append(b"a1", 0, b"This is A")).expect("commit failed");
        log.commit(&append(b"s1", 3, b"two")).expect("commit failed");
        log.commit(&append(b"b1", 0, b"This is B")).expect("commit failed");
        log.commit(&append(b"s1", 6, b"three")).expect("commit failed");

        let mut buf = [0u8; 11];
        log.read_stream(b"s1", 0, &mut buf).expect("read failed");
        assert_eq!(&buf, b"onetwothree");

        let mut buf = [0u8; 9];
        log.read_stream(b"a1", 0, &mut buf).expect("read failed");
        assert_eq!(&buf, b"This is A");
        log.read_stream(b"b1", 0, &mut buf).expect("read failed");
        assert_eq!(&buf, b"This is B");
    }

    #[test]
    fn test_zero_length_append() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        log.commit(&append(b"s1", 0, b"")).expect("commit failed");
        log.commit(&append(b"s1", 0, b"data")).expect("commit failed");

        assert_eq!(log.stream_range(b"s1").unwrap(), Span::new(0, 4));
        let mut buf = [0u8; 4];
        log.read_stream(b"s1", 0, &mut buf).expect("read failed");
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn test_pollard_bounds_are_enforced() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        log.commit(&append(b"s1", 0, b"Hello")).expect("commit failed");
        assert!(matches!(
            log.commit(&pollard(b"s1", 5, 9)),
            Err(Error::InvalidInput(_))
        ));
        log.commit(&pollard(b"s1", 5, 3)).expect("commit failed");
        // Pollards never move backwards.
        assert!(matches!(
            log.commit(&pollard(b"s1", 5, 1)),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_finalize_rejects_further_mutations() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = CommitLog::create(dir.path().join("commit_0000.log")).expect("create failed");

        log.commit(&append(b"s1", 0, b"Hello")).expect("commit failed");
        log.finalize().expect("finalize failed");

        assert_eq!(log.commit(&append(b"s1", 5, b"x")), Err(Error::Finalized));
        assert_eq!(log.finalize(), Err(Error::Finalized));
        assert_eq!(log.close(), Err(Error::Finalized));
    }
}
