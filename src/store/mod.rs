//! The directory-level store: one writable commit log plus any number of
//! sealed logs, presented as a single namespace of streams.
//!
//! Log files are named `commit_NNNN.log` with a zero-padded four-digit
//! ordinal. On open, the store recovers the newest file; if that file is
//! already sealed it starts the next ordinal instead. Older sealed files
//! are opened lazily, on the first lookup that reaches them.
//!
//! A stream's bytes may be spread across several files: each sealed log
//! holds an earlier range, the active log the newest. Reads fan out from
//! newest to oldest, each log contributing the chunk of the request that
//! falls inside its range.
//!
//! Opening a store claims the directory's writer slot through an advisory
//! lock, so at most one process appends to it at a time.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::log::action::Action;
use crate::log::reader::{DictEntry, LogReader};
use crate::log::CommitLog;
use crate::span::Span;
use crate::{errinput, Error};

const LOG_PREFIX: &str = "commit_";
const LOG_SUFFIX: &str = ".log";
const LOCK_FILE: &str = "store.lock";
/// Four-digit file ordinals; rolling past this needs compaction.
const MAX_ORDINAL: u32 = 9999;

fn log_file_name(ordinal: u32) -> String {
    format!("{LOG_PREFIX}{ordinal:04}{LOG_SUFFIX}")
}

fn parse_ordinal(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Claims the directory's writer slot: takes an exclusive advisory lock on
/// the lock file and records our process ID in it, so a stuck store can be
/// traced back to its owner. The lock releases when the handle drops; the
/// file stays behind to avoid racing a concurrent claimant.
fn claim_writer(dir: &Path) -> Result<File> {
    let mut file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(LOCK_FILE))?;
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            return Err(Error::IO(format!(
                "store {} already has a writer: {}",
                dir.display(),
                std::io::Error::last_os_error()
            )));
        }
    }
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(file)
}

/// Information about a stored stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStat {
    /// The stream's end offset: total bytes ever appended.
    pub size: u64,
}

/// A per-directory store of streams.
pub struct Store {
    dir: PathBuf,
    /// Holding this file's advisory lock makes us the directory's writer.
    _lock: File,
    log: CommitLog,
    active_ordinal: u32,
    /// Sealed logs, oldest first. Opened lazily.
    readers: Vec<LogReader>,
}

/// One log that holds part of a requested stream range.
enum Source {
    Active(Span),
    Sealed(usize, DictEntry),
}

impl Source {
    fn span(&self) -> Span {
        match self {
            Source::Active(span) => *span,
            Source::Sealed(_, entry) => entry.span,
        }
    }
}

impl Store {
    /// Opens (or creates) the store in `dir`, locking the directory and
    /// recovering the newest log file.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = claim_writer(&dir)?;

        let mut ordinals: Vec<u32> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                parse_ordinal(entry.file_name().to_str()?)
            })
            .collect();
        ordinals.sort_unstable();

        let (log, active_ordinal, sealed) = match ordinals.last().copied() {
            None => {
                let log = CommitLog::create(dir.join(log_file_name(0)))?;
                (log, 0, Vec::new())
            }
            Some(last) => match CommitLog::recover(dir.join(log_file_name(last))) {
                Ok(log) => {
                    ordinals.pop();
                    (log, last, ordinals)
                }
                Err(Error::Finalized) => {
                    if last >= MAX_ORDINAL {
                        return errinput!("log ordinal space exhausted; store needs compaction");
                    }
                    let log = CommitLog::create(dir.join(log_file_name(last + 1)))?;
                    (log, last + 1, ordinals)
                }
                Err(e) => return Err(e),
            },
        };

        let readers = sealed
            .iter()
            .map(|&n| LogReader::new(dir.join(log_file_name(n))))
            .collect::<Vec<_>>();
        info!(
            dir = %dir.display(),
            sealed = readers.len(),
            active = active_ordinal,
            "opened store"
        );
        Ok(Self {
            dir,
            _lock: lock,
            log,
            active_ordinal,
            readers,
        })
    }

    /// Information about a stored stream, from the newest log that knows it.
    pub fn stat(&mut self, stream: &[u8]) -> Result<StreamStat> {
        match self.log.stream_range(stream) {
            Ok(span) => return Ok(StreamStat { size: span.to }),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        for index in (0..self.readers.len()).rev() {
            if !self.readers[index].is_open() {
                self.readers[index].open()?;
            }
            match self.readers[index].search(stream) {
                Ok(entry) => return Ok(StreamStat { size: entry.span.to }),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound)
    }

    /// Appends `data` at the stream's current end, durably.
    pub fn append(&mut self, stream: &[u8], data: &[u8]) -> Result<()> {
        let offset = match self.stat(stream) {
            Ok(stat) => stat.size,
            Err(Error::NotFound) => 0,
            Err(e) => return Err(e),
        };
        self.log.commit(&Action::Append {
            stream: stream.to_vec(),
            offset,
            data: data.to_vec(),
        })
    }

    /// Drops the stream prefix below `offset`. The stream must be present in
    /// the active log; truncating data that lives only in sealed files is
    /// deferred to compaction.
    pub fn pollard(&mut self, stream: &[u8], offset: u64) -> Result<()> {
        let stat = self.stat(stream)?;
        self.log.commit(&Action::Pollard {
            stream: stream.to_vec(),
            offset: stat.size,
            pollard_pos: offset,
        })
    }

    /// Reads stream bytes starting at `offset`, fanning the request out over
    /// the logs from newest to oldest. Returns the byte count actually read,
    /// which is shorter than `buf` when the stream ends early. Fails with
    /// `InvalidInput` when the head of the requested range has been
    /// pollarded away, and `NotFound` when no log knows the stream.
    pub fn read(&mut self, stream: &[u8], offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut sources = Vec::new();
        match self.log.stream_range(stream) {
            Ok(span) => sources.push(Source::Active(span)),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        for index in (0..self.readers.len()).rev() {
            if !self.readers[index].is_open() {
                self.readers[index].open()?;
            }
            match self.readers[index].search(stream) {
                Ok(entry) => sources.push(Source::Sealed(index, entry)),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        if sources.is_empty() {
            return Err(Error::NotFound);
        }

        let request_end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::InvalidInput("read range overflows".into()))?;
        let to = request_end.min(sources[0].span().to);
        if offset >= to {
            return Ok(0);
        }
        let total = (to - offset) as usize;

        // Fill back-to-front: each log owns a chunk adjacent to the part
        // already covered, newest bytes first.
        let mut uncovered_to = to;
        for source in &sources {
            if uncovered_to <= offset {
                break;
            }
            let take = Span::new(offset, uncovered_to).intersect(source.span());
            if take.is_empty() || take.to < uncovered_to {
                continue;
            }
            let start = (take.from - offset) as usize;
            let len = take.size() as usize;
            match source {
                Source::Active(_) => {
                    self.log
                        .read_stream(stream, take.from, &mut buf[start..start + len])?
                }
                Source::Sealed(index, entry) => {
                    self.readers[*index].read(entry, take.from, &mut buf[start..start + len])?
                }
            }
            uncovered_to = take.from;
        }
        if uncovered_to > offset {
            return errinput!("stream bytes [{offset}, {uncovered_to}) are no longer available");
        }
        Ok(total)
    }

    /// Seals the active log and starts the next ordinal. Reads keep working
    /// across the rotation; appends go to the new log.
    pub fn rotate(&mut self) -> Result<()> {
        if self.active_ordinal >= MAX_ORDINAL {
            return errinput!("log ordinal space exhausted; store needs compaction");
        }
        self.log.finalize()?;
        let next = self.active_ordinal + 1;
        let log = CommitLog::create(self.dir.join(log_file_name(next)))?;
        let sealed = std::mem::replace(&mut self.log, log);
        self.readers.push(LogReader::new(sealed.path()));
        self.active_ordinal = next;
        info!(dir = %self.dir.display(), active = next, "rotated log");
        Ok(())
    }

    /// Closes the active log and all sealed readers, releasing the
    /// directory lock.
    pub fn close(mut self) -> Result<()> {
        for reader in &mut self.readers {
            reader.close();
        }
        self.log.close()
    }
}
